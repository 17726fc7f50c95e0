//! This example demonstrates how to incrementally evaluate scripts which can
//! depend on other scripts, recomputing a script's result only if a file it
//! depends on changed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use evalgraph::{Engine, Environment, EvalError, Key, Options, Outcome, Registry};

fn main() {
    // Create some scripts in the calc language. This language supports addition
    // and `eval` statements referring to other files.
    let files = Arc::new(Files::default());
    files.write("alpha.calc", "2 + eval beta.calc");
    files.write("beta.calc", "2 + 3");
    files.write("gamma.calc", "8 + 3");

    let mut engine = engine(&files);
    let options = Options::new();

    // Computes `alpha.calc` and `beta.calc`. The evaluation of `alpha.calc`
    // is restarted once `beta.calc` is done.
    let result = engine.evaluate(&[Calc::Eval("alpha.calc".into())], &options);
    report(&result);

    // Nothing is computed: `beta.calc` was evaluated on the way.
    report(&engine.evaluate(&[Calc::Eval("beta.calc".into())], &options));

    // Modify the gamma file. Nothing depends on it yet, so nothing is dirtied.
    files.write("gamma.calc", "42");
    assert_eq!(engine.invalidate(&[Calc::Read("gamma.calc".into())]), 0);
    report(&engine.evaluate(&[Calc::Eval("alpha.calc".into())], &options));

    // Modify the beta file, which now depends on gamma.
    files.write("beta.calc", "4 + eval gamma.calc");
    engine.invalidate(&[Calc::Read("beta.calc".into())]);
    report(&engine.evaluate(&[Calc::Eval("alpha.calc".into())], &options));

    // Reformat the beta file. It is read again, but its value stays the
    // same, so `alpha.calc` is confirmed without being evaluated again.
    files.write("beta.calc", "4+eval gamma.calc");
    engine.invalidate(&[Calc::Read("beta.calc".into())]);
    report(&engine.evaluate(&[Calc::Eval("alpha.calc".into())], &options));
}

/// The facts about calc scripts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Key)]
enum Calc {
    /// The text of a file.
    Read(PathBuf),
    /// The result of evaluating a file.
    Eval(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Value {
    Text(String),
    Number(i32),
}

fn engine(files: &Arc<Files>) -> Engine<Calc, Value> {
    let files = files.clone();
    let registry = Registry::<Calc, Value>::builder()
        .register_fn(CalcKind::Read, move |key, _| files.read(key))
        .register_fn(CalcKind::Eval, evaluate)
        .build()
        .expect("the registry has no factories");
    Engine::new(registry)
}

/// Evaluate a `.calc` script.
fn evaluate(key: &Calc, env: &mut Environment<'_, Calc, Value>) -> Outcome<Calc, Value> {
    let Calc::Eval(path) = key else { unreachable!() };
    let Some(text) = env.get(&Calc::Read(path.clone()))? else { return Ok(None) };
    let Value::Text(script) = &*text else { unreachable!() };

    let mut sum = 0;
    for part in script.split('+').map(str::trim) {
        match part.strip_prefix("eval ") {
            Some(path) => {
                if let Some(Value::Number(n)) = env.get(&Calc::Eval(path.into()))?.as_deref() {
                    sum += n;
                }
            }
            None => {
                sum += part.parse::<i32>().map_err(|_| {
                    EvalError::computation(key.clone(), format!("`{part}` is not a number"))
                })?
            }
        }
    }

    Ok((!env.values_missing()).then_some(Value::Number(sum)))
}

fn report(result: &evalgraph::EvaluationResult<Calc, Value>) {
    for (key, value) in result.iter() {
        println!("{key:?} = {value:?}");
    }
    println!("{:?}", result.statistics());
}

/// File storage.
#[derive(Default)]
struct Files(RwLock<HashMap<PathBuf, String>>);

impl Files {
    /// Read a file from storage.
    fn read(&self, key: &Calc) -> Outcome<Calc, Value> {
        let Calc::Read(path) = key else { unreachable!() };
        let files = self.0.read().map_err(|_| EvalError::computation(key.clone(), "poisoned"))?;
        match files.get(path) {
            Some(text) => Ok(Some(Value::Text(text.clone()))),
            None => Err(EvalError::computation(key.clone(), "file not found")),
        }
    }

    /// Write a file to storage.
    fn write(&self, path: &str, text: &str) {
        if let Ok(mut files) = self.0.write() {
            files.insert(path.into(), text.into());
        }
    }
}
