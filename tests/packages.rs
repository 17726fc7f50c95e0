//! Resolving the package that contains a directory by walking up the tree.
//!
//! Run with `cargo test --all-features`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};

use evalgraph::{Engine, Environment, EvalError, Key, Options, Outcome, Registry, State};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Key)]
enum Lookup {
    /// Whether a directory holds a build file.
    Package(PathBuf),
    /// The closest ancestor directory, including itself, that holds a build
    /// file.
    Containing(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Found {
    Package { exists: bool },
    Containing(Option<PathBuf>),
}

/// An in-memory file system that only knows about build files.
#[derive(Default)]
struct Files {
    build_files: RwLock<Vec<(PathBuf, String)>>,
    package_lookups: AtomicUsize,
    containing_lookups: AtomicUsize,
}

impl Files {
    fn with(packages: &[&str]) -> Arc<Self> {
        let files = Self::default();
        for dir in packages {
            files.add_package(dir, "");
        }
        Arc::new(files)
    }

    fn add_package(&self, dir: &str, contents: &str) {
        self.build_files.write().unwrap().push((dir.into(), contents.into()));
    }

    fn lookups(&self) -> (usize, usize) {
        (
            self.package_lookups.swap(0, Ordering::SeqCst),
            self.containing_lookups.swap(0, Ordering::SeqCst),
        )
    }

    fn lookup_package(&self, key: &Lookup) -> Outcome<Lookup, Found> {
        self.package_lookups.fetch_add(1, Ordering::SeqCst);
        let Lookup::Package(dir) = key else { unreachable!() };
        let files = self.build_files.read().unwrap();
        match files.iter().find(|(path, _)| path == dir) {
            Some((_, contents)) if contents.contains("syntax error") => {
                Err(EvalError::computation(key.clone(), "malformed build file"))
            }
            found => Ok(Some(Found::Package { exists: found.is_some() })),
        }
    }

    fn containing_package(
        &self,
        key: &Lookup,
        env: &mut Environment<'_, Lookup, Found>,
    ) -> Outcome<Lookup, Found> {
        self.containing_lookups.fetch_add(1, Ordering::SeqCst);
        let Lookup::Containing(dir) = key else { unreachable!() };

        let Some(lookup) = env.get(&Lookup::Package(dir.clone()))? else {
            return Ok(None);
        };
        if *lookup == (Found::Package { exists: true }) {
            return Ok(Some(Found::Containing(Some(dir.clone()))));
        }

        let Some(parent) = dir.parent() else {
            return Ok(Some(Found::Containing(None)));
        };
        let Some(found) = env.get(&containing(parent))? else {
            return Ok(None);
        };
        Ok(Some((*found).clone()))
    }

    fn engine(self: &Arc<Self>) -> Engine<Lookup, Found> {
        let (packages, ancestors) = (self.clone(), self.clone());
        let registry = Registry::<Lookup, Found>::builder()
            .register_fn(LookupKind::Package, move |key, _| packages.lookup_package(key))
            .register_fn(LookupKind::Containing, move |key, env| {
                ancestors.containing_package(key, env)
            })
            .build()
            .unwrap();
        Engine::new(registry)
    }
}

fn containing(dir: impl AsRef<Path>) -> Lookup {
    Lookup::Containing(dir.as_ref().to_path_buf())
}

fn package(dir: impl AsRef<Path>) -> Lookup {
    Lookup::Package(dir.as_ref().to_path_buf())
}

fn resolved(engine: &Engine<Lookup, Found>, dir: &str) -> Option<PathBuf> {
    match engine.get(&containing(dir)).as_deref() {
        Some(Found::Containing(found)) => found.clone(),
        other => panic!("{dir} is not resolved: {other:?}"),
    }
}

/// Test that the lookup stops at the closest package.
#[test]
fn test_package_in_ancestor() {
    let files = Files::with(&["/a"]);
    let engine = files.engine();

    let result = engine.evaluate(&[containing("/a/b/c")], &Options::new());
    assert!(result.success());
    assert_eq!(resolved(&engine, "/a/b/c"), Some("/a".into()));
    assert_eq!(resolved(&engine, "/a/b"), Some("/a".into()));
    // Each lookup restarts once per missing dependency.
    assert_eq!(files.lookups(), (3, 8));

    // The root directory was never needed.
    assert_eq!(engine.state(&containing("/")), None);
    assert_eq!(
        engine.deps(&containing("/a/b/c")),
        Some(vec![package("/a/b/c"), containing("/a/b")]),
    );
    assert_eq!(engine.deps(&containing("/a")), Some(vec![package("/a")]));
}

/// Test that the lookup exhausts all ancestors without a package.
#[test]
fn test_no_package() {
    let files = Files::with(&[]);
    let engine = files.engine();

    let result = engine.evaluate(&[containing("/a/b/c")], &Options::new());
    assert_eq!(
        result.value(&containing("/a/b/c")).map(|found| &**found),
        Some(&Found::Containing(None)),
    );
    assert_eq!(engine.state(&containing("/")), Some(State::Done));
    assert_eq!(files.lookups().0, 4);
}

/// Test that a new package is picked up after invalidation, without looking
/// above it again.
#[test]
fn test_new_package() {
    let files = Files::with(&["/a"]);
    let mut engine = files.engine();
    engine.evaluate(&[containing("/a/b/c")], &Options::new());
    files.lookups();

    files.add_package("/a/b", "");
    assert_eq!(engine.invalidate(&[package("/a/b")]), 3);

    let result = engine.evaluate(&[containing("/a/b/c")], &Options::new());
    assert!(result.success());
    assert_eq!(resolved(&engine, "/a/b/c"), Some("/a/b".into()));
    assert_eq!(files.lookups(), (1, 2));

    // `/a` is no longer needed by `/a/b`.
    assert_eq!(engine.reverse_deps(&containing("/a")), Some(vec![]));
    assert_eq!(engine.evict_unreachable(&[containing("/a/b/c")]), 2);
    assert_eq!(engine.state(&package("/a")), None);
}

/// Test that an unrelated change is confirmed without walking the tree again.
#[test]
fn test_unrelated_change() {
    let files = Files::with(&["/a"]);
    let mut engine = files.engine();
    engine.evaluate(&[containing("/a/b/c")], &Options::new());
    files.lookups();

    // `/a/b` changed, but still has no build file.
    engine.invalidate(&[package("/a/b")]);
    let result = engine.evaluate(&[containing("/a/b/c")], &Options::new());
    assert_eq!(resolved(&engine, "/a/b/c"), Some("/a".into()));
    assert_eq!(files.lookups(), (1, 0));
    assert_eq!(result.statistics().verified, 2);
    assert_eq!(result.statistics().pruned, 1);
}

/// Test that a malformed build file fails the lookups below it.
#[test]
fn test_malformed_package() {
    let files = Files::with(&["/a"]);
    files.add_package("/a/b", "syntax error");
    let engine = files.engine();

    let roots = [containing("/a/b/c"), containing("/a/x")];
    let result = engine.evaluate(&roots, &Options::new().keep_going(true));
    let err = result.error(&containing("/a/b/c")).unwrap();
    assert_eq!(err.key(), Some(&package("/a/b")));
    assert_eq!(err.to_string(), "failed to compute Package(\"/a/b\"): malformed build file");
    assert_eq!(resolved(&engine, "/a/x"), Some("/a".into()));
    assert_eq!(result.errors().len(), 1);
}

/// Test many lookups sharing ancestors on many workers.
#[test]
fn test_shared_ancestors() {
    let files = Files::with(&["/src/x2"]);
    let engine = files.engine();

    let mut roots = Vec::new();
    for i in 0..5 {
        for j in 0..5 {
            roots.push(containing(format!("/src/x{i}/y{j}")));
        }
    }

    let result = engine.evaluate(&roots, &Options::new().threads(8));
    assert!(result.success());
    for (key, found) in result.iter() {
        let Lookup::Containing(dir) = key else { unreachable!() };
        let expected = dir.starts_with("/src/x2").then(|| PathBuf::from("/src/x2"));
        assert_eq!(found.as_deref(), Ok(&Found::Containing(expected)));
    }

    // Every directory was looked at once.
    let dirs: HashSet<_> = roots
        .iter()
        .flat_map(|key| {
            let Lookup::Containing(dir) = key else { unreachable!() };
            dir.ancestors().map(Path::to_path_buf).collect::<Vec<_>>()
        })
        .collect();
    assert_eq!(dirs.len(), 32);
    assert_eq!(files.lookups().0, dirs.len());
}
