//! Assembling a configuration from fragments created by ordered factories.
//!
//! Run with `cargo test --all-features`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use evalgraph::{
    BootstrapError, Computation, Engine, Environment, EvalError, Key, Options, Outcome,
    Registry,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Key)]
#[key(kind = Kind)]
enum Config {
    /// A build option given on the command line.
    Flag(&'static str),
    Cpu,
    Cc,
    Java,
    /// All fragments, in creation order.
    Assembled,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Fragment {
    Flag(String),
    Cpu(String),
    Cc { compiler: String, cpu: String },
    Java { cpu: String },
    Assembled(Vec<String>),
}

impl Fragment {
    fn describe(&self) -> String {
        match self {
            Self::Flag(value) => value.clone(),
            Self::Cpu(cpu) => format!("cpu={cpu}"),
            Self::Cc { compiler, cpu } => format!("cc={compiler}@{cpu}"),
            Self::Java { cpu } => format!("java@{cpu}"),
            Self::Assembled(parts) => parts.join(", "),
        }
    }

    fn cpu(&self) -> &str {
        match self {
            Self::Cpu(cpu) | Self::Cc { cpu, .. } | Self::Java { cpu } => cpu,
            _ => "",
        }
    }
}

/// The fragment key a factory kind produces.
fn fragment(kind: Kind) -> Option<Config> {
    match kind {
        Kind::Cpu => Some(Config::Cpu),
        Kind::Cc => Some(Config::Cc),
        Kind::Java => Some(Config::Java),
        Kind::Flag | Kind::Assembled => None,
    }
}

#[derive(Default)]
struct Setup {
    flags: RwLock<HashMap<&'static str, String>>,
    order: OnceLock<Vec<Kind>>,
    invocations: Mutex<HashMap<Kind, usize>>,
}

impl Setup {
    fn new(flags: &[(&'static str, &str)]) -> Arc<Self> {
        let setup = Self::default();
        for &(name, value) in flags {
            setup.set(name, value);
        }
        Arc::new(setup)
    }

    fn set(&self, name: &'static str, value: &str) {
        self.flags.write().unwrap().insert(name, value.into());
    }

    fn invocations(&self, kind: Kind) -> usize {
        self.invocations.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    fn flag(&self, key: &Config) -> Outcome<Config, Fragment> {
        let Config::Flag(name) = key else { unreachable!() };
        match self.flags.read().unwrap().get(name) {
            Some(value) => Ok(Some(Fragment::Flag(value.clone()))),
            None => Err(EvalError::computation(key.clone(), format!("unknown flag `{name}`"))),
        }
    }

    fn assemble(&self, env: &mut Environment<'_, Config, Fragment>) -> Outcome<Config, Fragment> {
        let order = self.order.get().map(Vec::as_slice).unwrap_or_default();
        let keys: Vec<_> = order.iter().filter_map(|&kind| fragment(kind)).collect();
        let values = env.get_many(&keys)?;
        if env.values_missing() {
            return Ok(None);
        }

        let parts = keys
            .iter()
            .filter_map(|key| values[key].as_deref())
            .map(Fragment::describe)
            .collect();
        Ok(Some(Fragment::Assembled(parts)))
    }

    /// Register the given factories, in the given order, with their
    /// requirements.
    fn engine(
        self: &Arc<Self>,
        factories: &[(Kind, &[Kind])],
    ) -> Result<Engine<Config, Fragment>, BootstrapError<Kind>> {
        let (flags, assembler) = (self.clone(), self.clone());
        let mut builder = Registry::<Config, Fragment>::builder()
            .register_fn(Kind::Flag, move |key, _| flags.flag(key))
            .register_fn(Kind::Assembled, move |_, env| assembler.assemble(env));
        for &(kind, requires) in factories {
            let factory = FragmentFactory(self.clone());
            builder = builder.register_factory(kind, factory, requires.iter().copied(), kind);
        }

        let registry = builder.build()?;
        let _ = self.order.set(registry.creation_order().to_vec());
        Ok(Engine::new(registry))
    }
}

/// Creates the fragment for its key from flags and the fragments it requires.
struct FragmentFactory(Arc<Setup>);

impl FragmentFactory {
    fn flag(
        env: &mut Environment<'_, Config, Fragment>,
        name: &'static str,
    ) -> Result<Option<String>, EvalError<Config>> {
        Ok(env.get(&Config::Flag(name))?.map(|value| value.describe()))
    }
}

impl Computation<Config, Fragment> for FragmentFactory {
    fn compute(
        &self,
        key: &Config,
        env: &mut Environment<'_, Config, Fragment>,
    ) -> Outcome<Config, Fragment> {
        *self.0.invocations.lock().unwrap().entry(key.kind()).or_default() += 1;
        match key {
            Config::Cpu => Ok(Self::flag(env, "cpu")?.map(Fragment::Cpu)),
            Config::Cc => {
                let cpu = env.get(&Config::Cpu)?;
                let compiler = Self::flag(env, "compiler")?;
                let (Some(cpu), Some(compiler)) = (cpu, compiler) else { return Ok(None) };
                Ok(Some(Fragment::Cc { compiler, cpu: cpu.cpu().into() }))
            }
            Config::Java => {
                let Some(cc) = env.get(&Config::Cc)? else { return Ok(None) };
                Ok(Some(Fragment::Java { cpu: cc.cpu().into() }))
            }
            _ => Err(EvalError::computation(key.clone(), "not a fragment")),
        }
    }
}

const STANDARD: &[(Kind, &[Kind])] =
    &[(Kind::Java, &[Kind::Cpu, Kind::Cc]), (Kind::Cc, &[Kind::Cpu]), (Kind::Cpu, &[])];

/// Test that factories are created after the factories they require.
#[test]
fn test_creation_order() {
    let setup = Setup::new(&[]);
    let engine = setup.engine(STANDARD).unwrap();
    assert_eq!(engine.registry().creation_order(), &[Kind::Cpu, Kind::Cc, Kind::Java]);

    // Unconstrained factories keep their registration order.
    let setup = Setup::new(&[]);
    let engine = setup
        .engine(&[(Kind::Java, &[]), (Kind::Cc, &[Kind::Cpu]), (Kind::Cpu, &[])])
        .unwrap();
    assert_eq!(engine.registry().creation_order(), &[Kind::Java, Kind::Cpu, Kind::Cc]);
}

/// Test that requirement cycles are rejected at startup.
#[test]
fn test_cycle_is_rejected() {
    let setup = Setup::new(&[]);
    let err = setup
        .engine(&[(Kind::Cpu, &[]), (Kind::Cc, &[Kind::Java]), (Kind::Java, &[Kind::Cc])])
        .unwrap_err();
    let BootstrapError::Cycle { kinds } = &err else { panic!("expected a cycle, got {err}") };
    assert_eq!(kinds, &[Kind::Cc, Kind::Java]);
    assert_eq!(err.to_string(), "fragment factories form a cycle: Cc -> Java -> Cc");
    assert!(setup.order.get().is_none());
}

/// Test that a requirement without a producer is rejected at startup.
#[test]
fn test_missing_producer_is_rejected() {
    let setup = Setup::new(&[]);
    let err = setup.engine(&[(Kind::Java, &[Kind::Cc]), (Kind::Cpu, &[])]).unwrap_err();
    assert_eq!(err, BootstrapError::MissingProducer { kind: Kind::Cc, required_by: Kind::Java });
}

/// Test that a kind cannot be registered twice.
#[test]
fn test_duplicate_is_rejected() {
    let setup = Setup::new(&[]);
    let err = setup.engine(&[(Kind::Cpu, &[]), (Kind::Cpu, &[])]).unwrap_err();
    assert_eq!(err, BootstrapError::Duplicate { kind: Kind::Cpu });
}

/// Test assembling the configuration from its fragments.
#[test]
fn test_assemble() {
    let setup = Setup::new(&[("cpu", "k8"), ("compiler", "gcc")]);
    let engine = setup.engine(STANDARD).unwrap();

    let result = engine.evaluate(&[Config::Assembled], &Options::new());
    let assembled = result.value(&Config::Assembled).unwrap();
    assert_eq!(assembled.describe(), "cpu=k8, cc=gcc@k8, java@k8");
    assert_eq!(engine.deps(&Config::Assembled), Some(vec![Config::Cpu, Config::Cc, Config::Java]));
    assert_eq!(engine.deps(&Config::Cc), Some(vec![Config::Cpu, Config::Flag("compiler")]));
}

/// Test that changing a flag only recreates the fragments reading it.
#[test]
fn test_flag_change() {
    let setup = Setup::new(&[("cpu", "k8"), ("compiler", "gcc")]);
    let mut engine = setup.engine(STANDARD).unwrap();
    engine.evaluate(&[Config::Assembled], &Options::new());
    assert_eq!(setup.invocations(Kind::Cpu), 1);

    setup.set("compiler", "clang");
    assert_eq!(engine.invalidate(&[Config::Flag("compiler")]), 4);
    let result = engine.evaluate(&[Config::Assembled], &Options::new());
    let assembled = result.value(&Config::Assembled).unwrap();
    assert_eq!(assembled.describe(), "cpu=k8, cc=clang@k8, java@k8");

    // The new compiler does not affect java, which is confirmed after
    // its recomputation yields the same value.
    assert_eq!(setup.invocations(Kind::Cpu), 1);
    assert_eq!(result.statistics().pruned, 1);
}

/// Test that a missing flag fails the fragments that need it.
#[test]
fn test_unknown_flag() {
    let setup = Setup::new(&[("cpu", "k8")]);
    let engine = setup.engine(STANDARD).unwrap();
    let options = Options::new().keep_going(true);
    let result = engine.evaluate(&[Config::Assembled, Config::Cpu], &options);
    assert_eq!(result.value(&Config::Cpu).map(|cpu| cpu.describe()), Some("cpu=k8".into()));
    let err = result.error(&Config::Assembled).unwrap();
    assert_eq!(err, &EvalError::computation(Config::Flag("compiler"), "unknown flag `compiler`"));
}
