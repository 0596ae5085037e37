use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{LazyLock, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::StoreError;

use super::{Store, StorePath};

/// Memoised [`hash_derivation_modulo`] results of derivations already in a
/// store, keyed by their path. Lives as long as the process.
static DRV_HASHES: LazyLock<Mutex<HashMap<StorePath, Hash32>>> = LazyLock::new(Default::default);

/// A build recipe: run `builder` with `args` and `env` so that it produces
/// every path in `outputs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Derivation {
    pub name: String,
    pub output_names: BTreeSet<String>,
    /// Output name to store path, filled in when the derivation is added to a
    /// store.
    #[serde(default)]
    pub outputs: BTreeMap<String, StorePath>,
    #[serde(default)]
    pub input_drvs: BTreeSet<StorePath>,
    #[serde(default)]
    pub input_srcs: BTreeSet<StorePath>,
    pub builder: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Fed to the builder's standard input.
    #[serde(default)]
    pub stdin: Option<String>,
    /// Per-derivation override of the global build timeout, in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Per-derivation override of the global silence limit, in seconds.
    #[serde(default)]
    pub max_silent_time: Option<u64>,
}

impl Derivation {
    /// A derivation with a single `out` output.
    pub fn new(name: impl Into<String>, builder: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output_names: BTreeSet::from(["out".to_string()]),
            outputs: BTreeMap::new(),
            input_drvs: BTreeSet::new(),
            input_srcs: BTreeSet::new(),
            builder: builder.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            stdin: None,
            timeout: None,
            max_silent_time: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn input_drv(mut self, drv: StorePath) -> Self {
        self.input_drvs.insert(drv);
        self
    }

    pub fn input_src(mut self, src: StorePath) -> Self {
        self.input_srcs.insert(src);
        self
    }

    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Store path name of output `output`: `out` is named after the
    /// derivation, every other output gets a suffix.
    pub fn output_path_name(&self, output: &str) -> String {
        if output == "out" {
            self.name.clone()
        } else {
            format!("{}-{output}", self.name)
        }
    }

    /// Fills in `outputs` from the derivation's hash.
    pub(crate) fn assign_outputs(&mut self, modulo: Hash32) -> Result<(), StoreError> {
        let mut outputs = BTreeMap::new();

        for output in &self.output_names {
            let digest = Hash32::hash(format!("output:{output}:{modulo}"));
            let path = StorePath::from_parts(digest, &self.output_path_name(output))?;
            outputs.insert(output.clone(), path);
        }

        self.outputs = outputs;
        Ok(())
    }
}

/// What the derivation hash covers: everything except the output paths, with
/// each input derivation replaced by its own hash.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Masked<'a> {
    name: &'a str,
    output_names: &'a BTreeSet<String>,
    input_drvs: BTreeMap<&'a StorePath, Hash32>,
    input_srcs: &'a BTreeSet<StorePath>,
    builder: &'a str,
    args: &'a [String],
    env: &'a BTreeMap<String, String>,
    stdin: Option<&'a str>,
}

/// Hash of a derivation that does not depend on its output paths, so that
/// output paths can be derived from it.
pub fn hash_derivation_modulo(store: &dyn Store, drv: &Derivation) -> Result<Hash32, StoreError> {
    let mut input_drvs = BTreeMap::new();
    for input in &drv.input_drvs {
        input_drvs.insert(input, hash_stored_derivation(store, input)?);
    }

    let masked = Masked {
        name: &drv.name,
        output_names: &drv.output_names,
        input_drvs,
        input_srcs: &drv.input_srcs,
        builder: &drv.builder,
        args: &drv.args,
        env: &drv.env,
        stdin: drv.stdin.as_deref(),
    };

    Ok(Hash32::hash(serde_json::to_vec(&masked)?))
}

fn hash_stored_derivation(store: &dyn Store, path: &StorePath) -> Result<Hash32, StoreError> {
    let cached = DRV_HASHES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(path)
        .copied();

    if let Some(hash) = cached {
        return Ok(hash);
    }

    // Not holding the lock while recursing into inputs
    let drv = store.read_derivation(path)?;
    let hash = hash_derivation_modulo(store, &drv)?;

    DRV_HASHES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(path.clone(), hash);

    Ok(hash)
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::store::LocalStore;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let store = LocalStore::open(&root).unwrap();
        (dir, store)
    }

    #[test]
    fn test_output_paths_are_deterministic() {
        let (_a, first) = store();
        let (_b, second) = store();

        let drv = Derivation::new("hello", "/bin/sh").arg("-c").arg("echo hi > $out");
        let p1 = first.add_derivation(drv.clone()).unwrap();
        let p2 = second.add_derivation(drv).unwrap();

        assert_eq!(p1, p2);
        assert!(p1.is_derivation());
        assert_eq!(p1.name(), "hello.drv");

        let stored = first.read_derivation(&p1).unwrap();
        assert_eq!(stored.outputs["out"].name(), "hello");
    }

    #[test]
    fn test_outputs_change_with_inputs() {
        let (_dir, store) = store();

        let a = Derivation::new("pkg", "/bin/sh").arg("a");
        let b = Derivation::new("pkg", "/bin/sh").arg("b");
        let a = store.read_derivation(&store.add_derivation(a).unwrap()).unwrap();
        let b = store.read_derivation(&store.add_derivation(b).unwrap()).unwrap();

        assert_ne!(a.outputs["out"], b.outputs["out"]);
    }

    #[test]
    fn test_extra_outputs_are_suffixed() {
        let (_dir, store) = store();

        let drv = Derivation::new("multi", "/bin/sh").outputs(["out", "dev"]);
        let drv = store.read_derivation(&store.add_derivation(drv).unwrap()).unwrap();

        assert_eq!(drv.outputs["out"].name(), "multi");
        assert_eq!(drv.outputs["dev"].name(), "multi-dev");
    }

    #[test]
    fn test_modulo_hash_ignores_outputs() {
        let (_dir, store) = store();

        let mut drv = Derivation::new("x", "/bin/sh");
        let before = hash_derivation_modulo(&store, &drv).unwrap();
        drv.assign_outputs(before).unwrap();

        assert_eq!(hash_derivation_modulo(&store, &drv).unwrap(), before);
    }
}
