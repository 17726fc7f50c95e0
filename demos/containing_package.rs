//! This example demonstrates dynamically discovered dependencies: finding the
//! package that contains a directory walks up the tree, but only as far as
//! needed, and each step is only known after the previous one finished.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use evalgraph::{Engine, Environment, Key, Options, Outcome, Registry};

fn main() {
    let fs = Arc::new(FileSystem::default());
    fs.add_build_file("/repo/src");

    let mut engine = engine(&fs);
    let root = Lookup::Containing("/repo/src/lib/util".into());

    // Walks up from `util` to `src` in three chained lookups.
    let result = engine.evaluate(&[root.clone()], &Options::new());
    println!("{:?}", result.value(&root));
    println!("{:?}", engine.deps(&root));

    // A new build file in between only affects the lookups below it.
    fs.add_build_file("/repo/src/lib");
    engine.invalidate(&[Lookup::Package("/repo/src/lib".into())]);
    let result = engine.evaluate(&[root.clone()], &Options::new());
    println!("{:?}", result.value(&root));
    println!("{:?}", result.statistics());

    // The lookup of `src` is not needed anymore.
    let evicted = engine.evict_unreachable(&[root]);
    println!("evicted {evicted} entries");
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Key)]
enum Lookup {
    /// Whether a directory holds a build file.
    Package(PathBuf),
    /// The closest directory at or above this one holding a build file.
    Containing(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Found {
    Package(bool),
    Containing(Option<PathBuf>),
}

fn engine(fs: &Arc<FileSystem>) -> Engine<Lookup, Found> {
    let fs = fs.clone();
    let registry = Registry::<Lookup, Found>::builder()
        .register_fn(LookupKind::Package, move |key, _| {
            let Lookup::Package(dir) = key else { unreachable!() };
            Ok(Some(Found::Package(fs.has_build_file(dir))))
        })
        .register_fn(LookupKind::Containing, containing_package)
        .build()
        .expect("the registry has no factories");
    Engine::new(registry)
}

/// Find the package containing a directory.
fn containing_package(
    key: &Lookup,
    env: &mut Environment<'_, Lookup, Found>,
) -> Outcome<Lookup, Found> {
    let Lookup::Containing(dir) = key else { unreachable!() };

    let Some(lookup) = env.get(&Lookup::Package(dir.clone()))? else { return Ok(None) };
    if *lookup == Found::Package(true) {
        return Ok(Some(Found::Containing(Some(dir.clone()))));
    }

    // Only ask for the parent once we know this directory is not a package.
    let Some(parent) = dir.parent() else {
        return Ok(Some(Found::Containing(None)));
    };
    let Some(found) = env.get(&Lookup::Containing(parent.to_path_buf()))? else {
        return Ok(None);
    };
    Ok(Some((*found).clone()))
}

/// A file system that only knows about build files.
#[derive(Default)]
struct FileSystem(RwLock<HashSet<PathBuf>>);

impl FileSystem {
    fn add_build_file(&self, dir: &str) {
        if let Ok(mut dirs) = self.0.write() {
            dirs.insert(dir.into());
        }
    }

    fn has_build_file(&self, dir: &Path) -> bool {
        self.0.read().is_ok_and(|dirs| dirs.contains(dir))
    }
}
