//! Integration tests for codeprint
//!
//! These tests drive the Python front end and the fingerprint engine together,
//! through real source files on disk.

use codeprint_core::{CanonicalForm, Engine, EngineConfig, Environment, Error, Fingerprint, UnitId};
use codeprint_indexer::{create_parser_pool, discover_sources, ModuleLoader, PythonBuiltins};
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

struct Repo {
    dir: TempDir,
    env: Environment,
    loader: ModuleLoader,
    engine: Engine,
}

impl Repo {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        Repo {
            dir: TempDir::new().unwrap(),
            env: PythonBuiltins::new().environment(),
            loader: ModuleLoader::new(create_parser_pool()),
            engine: Engine::new(config),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `module`'s source and (re)load it.
    fn write(&self, module: &str, source: &str) {
        let path = self.root().join(format!("{}.py", module.replace('.', "/")));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, source).unwrap();
        let files = discover_sources(self.root()).unwrap();
        let file = files.iter().find(|f| f.module == module).unwrap();
        self.loader.load_file(&self.env, file).unwrap();
    }

    fn unit(&self, module: &str, name: &str) -> UnitId {
        self.env.lookup(module, name).unwrap()
    }

    fn fingerprint(&self, module: &str, name: &str) -> Fingerprint {
        self.engine.fingerprint(&self.env, self.unit(module, name)).unwrap()
    }
}

const FOO: &str = "def foo(x):\n    return helper(x) * 2\n";

/// Redefining a callee, renaming a parameter and changing arity.
#[test]
fn test_redefinition_scenario() {
    let repo = Repo::new();
    repo.write("m", &format!("def helper(x):\n    return x + 10\n\n{}", FOO));
    let d1 = repo.fingerprint("m", "foo");
    assert_eq!(d1, repo.fingerprint("m", "foo"));

    repo.write("m", &format!("def helper(x):\n    return x + 12\n\n{}", FOO));
    let d2 = repo.fingerprint("m", "foo");
    assert_ne!(d1, d2);

    repo.write(
        "m",
        "def helper(y):\n    return y + 12\n\ndef foo(y):\n    return helper(y) * 2\n",
    );
    assert_eq!(repo.fingerprint("m", "foo"), d2);

    repo.write(
        "m",
        "def helper(y):\n    return y + 12\n\ndef foo(x, y):\n    return x * y\n",
    );
    let d4 = repo.fingerprint("m", "foo");
    assert_ne!(d4, d2);
    assert_ne!(d4, d1);

    // Restoring the first definitions restores the first digest.
    repo.write("m", &format!("def helper(x):\n    return x + 10\n\n{}", FOO));
    assert_eq!(repo.fingerprint("m", "foo"), d1);
}

#[test]
fn test_mutual_recursion_from_source() {
    let repo = Repo::new();
    let source = r#"
def is_even(n):
    if n == 0:
        return True
    return is_odd(n - 1)

def is_odd(n):
    if n == 0:
        return False
    return is_even(n - 1)
"#;
    repo.write("parity", source);
    let even = repo.fingerprint("parity", "is_even");
    let odd = repo.fingerprint("parity", "is_odd");
    assert_eq!(even, odd);

    let report = repo
        .engine
        .fingerprint_verbose(&repo.env, repo.unit("parity", "is_even"))
        .unwrap();
    assert_eq!(report.cycle, vec!["parity.is_even", "parity.is_odd"]);

    repo.write("parity", &source.replace("return False", "return 0"));
    assert_ne!(repo.fingerprint("parity", "is_even"), even);
}

#[test]
fn test_cross_module_dependencies() {
    let repo = Repo::new();
    fs::create_dir_all(repo.root().join("pkg")).unwrap();
    fs::write(repo.root().join("pkg/__init__.py"), "").unwrap();
    repo.write("pkg.util", "def helper(x):\n    return x + 10\n");
    repo.write(
        "app",
        "from pkg.util import helper\nimport json\n\ndef main(x):\n    return json.dumps(helper(x))\n",
    );
    let before = repo.fingerprint("app", "main");

    // Unrelated additions to the imported module do not matter.
    repo.write(
        "pkg.util",
        "def helper(x):\n    return x + 10\n\ndef other():\n    return 1\n",
    );
    assert_eq!(repo.fingerprint("app", "main"), before);

    repo.write("pkg.util", "def helper(x):\n    return x - 10\n");
    assert_ne!(repo.fingerprint("app", "main"), before);
}

#[test]
fn test_same_body_in_two_modules() {
    let repo = Repo::new();
    repo.write("a", "def f(x):\n    return [i * 2 for i in range(x)]\n");
    repo.write("b", "def g(n):\n    return [k * 2 for k in range(n)]\n");
    assert_eq!(repo.fingerprint("a", "f"), repo.fingerprint("b", "g"));
}

#[test]
fn test_value_references_are_opt_in() {
    let source = |body: &str| {
        format!(
            "def helper(x):\n    return {}\n\ndef apply(xs):\n    return list(map(helper, xs))\n",
            body
        )
    };

    let calls = Repo::new();
    calls.write("m", &source("x + 1"));
    let before = calls.fingerprint("m", "apply");
    calls.write("m", &source("x + 2"));
    assert_eq!(calls.fingerprint("m", "apply"), before);

    let values = Repo::with_config(EngineConfig {
        follow_value_references: true,
        ..Default::default()
    });
    values.write("m", &source("x + 1"));
    let before = values.fingerprint("m", "apply");
    values.write("m", &source("x + 2"));
    assert_ne!(values.fingerprint("m", "apply"), before);
}

#[test]
fn test_strict_config_from_repository() {
    let repo = Repo::new();
    fs::write(repo.root().join("codeprint.toml"), "strict = true\nparallel = true\n").unwrap();
    let config = EngineConfig::discover(repo.root()).unwrap();
    assert!(config.strict);
    assert!(config.parallel);
    assert!(!config.follow_value_references);

    let env = PythonBuiltins::new().environment();
    let caller = env.define("m", "caller", CanonicalForm::new(0));
    env.define_unavailable("m", "broken", "syntax error at line 3");
    let engine = Engine::new(config);
    // `caller` does not reach `broken`, so strict mode has nothing to reject.
    assert!(engine.fingerprint(&env, caller).is_ok());
    let broken = env.lookup("m", "broken").unwrap();
    assert!(matches!(
        engine.fingerprint(&env, broken),
        Err(Error::Canonicalization { .. })
    ));
}

#[test]
fn test_cli_hash_and_units() {
    let repo = Repo::new();
    fs::write(repo.root().join("m.py"), format!("def helper(x):\n    return x + 10\n\n{}", FOO)).unwrap();
    repo.loader
        .load_module(&repo.env, "m", &fs::read_to_string(repo.root().join("m.py")).unwrap())
        .unwrap();
    let expected = repo.fingerprint("m", "foo");

    let output = Command::new(env!("CARGO_BIN_EXE_codeprint"))
        .arg("--root")
        .arg(repo.root())
        .args(["hash", "m.foo"])
        .output()
        .expect("Failed to execute codeprint");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("{}  m.foo", expected));

    let output = Command::new(env!("CARGO_BIN_EXE_codeprint"))
        .arg("--root")
        .arg(repo.root())
        .args(["units", "--json"])
        .output()
        .expect("Failed to execute codeprint");
    assert!(output.status.success());
    let units: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let labels: Vec<&str> = units
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["label"].as_str().unwrap())
        .collect();
    assert_eq!(labels, vec!["m.foo", "m.helper"]);
}

#[test]
fn test_cli_rejects_unknown_target() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("m.py"), "def f():\n    return 1\n").unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_codeprint"))
        .arg("--root")
        .arg(dir.path())
        .args(["hash", "nope"])
        .output()
        .expect("Failed to execute codeprint");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No function named nope"));
}
