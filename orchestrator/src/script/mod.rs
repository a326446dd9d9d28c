//! Wrapper script generation
//!
//! Produces the Python programs that run user code inside a container. Both
//! generators are pure functions of the configuration and the code: paths are
//! derived from `working_dir` and the code is embedded as a string literal, so
//! nothing in the user's code can escape into the wrapper itself.
//!
//! Transient protocol: the wrapper reads `state.json` (absent means empty),
//! executes the code in a namespace seeded from it and writes every exportable
//! namespace entry plus `__stdout__`, `__stderr__` and `__error__` to
//! `output.json`.
//!
//! Persistent protocol: the wrapper restores the namespace pickled at
//! `.pysandbox_session.pkl`, executes the code, saves the namespace again and
//! prints a JSON payload between the `---OUTPUT_START---` and
//! `---OUTPUT_END---` marker lines.

use crate::config::SandboxConfig;

/// Line printed immediately before the persistent JSON payload
pub const OUTPUT_START_MARKER: &str = "---OUTPUT_START---";
/// Line printed immediately after the persistent JSON payload
pub const OUTPUT_END_MARKER: &str = "---OUTPUT_END---";

pub const SCRIPT_FILE: &str = "execute_script.py";
pub const STATE_FILE: &str = "state.json";
pub const OUTPUT_FILE: &str = "output.json";
pub const SESSION_STATE_FILE: &str = ".pysandbox_session.pkl";

/// Reserved keys in the transient output document
pub const STDOUT_KEY: &str = "__stdout__";
pub const STDERR_KEY: &str = "__stderr__";
pub const ERROR_KEY: &str = "__error__";

const SHARED_HELPERS: &str = r#"
def ensure_serializable(obj):
    if isinstance(obj, float) and not math.isfinite(obj):
        return str(obj)
    if isinstance(obj, (str, int, float, bool, type(None))):
        return obj
    if isinstance(obj, (list, tuple, set, frozenset)):
        return [ensure_serializable(item) for item in obj]
    if isinstance(obj, dict):
        return {str(k): ensure_serializable(v) for k, v in obj.items()}
    return str(obj)


def exportable(key, value):
    if key.startswith("__") and key.endswith("__"):
        return False
    return not isinstance(
        value,
        (types.ModuleType, types.FunctionType, types.BuiltinFunctionType, types.MethodType, type),
    )
"#;

const TRANSIENT_TEMPLATE: &str = r#"import io
import json
import math
import os
import types
from contextlib import redirect_stderr, redirect_stdout

STATE_PATH = __PYSANDBOX_STATE_PATH__
OUTPUT_PATH = __PYSANDBOX_OUTPUT_PATH__
CODE = __PYSANDBOX_CODE__
__PYSANDBOX_HELPERS__

namespace = {"__name__": "__main__"}
if os.path.exists(STATE_PATH):
    with open(STATE_PATH, "r", encoding="utf-8") as handle:
        loaded = json.load(handle)
    if isinstance(loaded, dict):
        namespace.update(loaded)

stdout_capture = io.StringIO()
stderr_capture = io.StringIO()
error = None
try:
    with redirect_stdout(stdout_capture), redirect_stderr(stderr_capture):
        exec(compile(CODE, "<sandbox>", "exec"), namespace)
except BaseException as exc:
    error = f"{type(exc).__name__}: {exc}"

payload = {
    key: ensure_serializable(value)
    for key, value in namespace.items()
    if exportable(key, value)
}
payload["__stdout__"] = stdout_capture.getvalue()
payload["__stderr__"] = stderr_capture.getvalue()
payload["__error__"] = error

with open(OUTPUT_PATH, "w", encoding="utf-8") as handle:
    json.dump(payload, handle)
"#;

const PERSISTENT_TEMPLATE: &str = r#"import io
import json
import math
import os
import pickle
import sys
import traceback
import types
from contextlib import redirect_stderr, redirect_stdout

SESSION_PATH = __PYSANDBOX_SESSION_PATH__
CODE = __PYSANDBOX_CODE__
__PYSANDBOX_HELPERS__

namespace = {"__name__": "__main__"}
if os.path.exists(SESSION_PATH):
    try:
        with open(SESSION_PATH, "rb") as handle:
            saved = pickle.load(handle)
        if isinstance(saved, dict):
            namespace.update(saved)
    except Exception as exc:
        print(f"could not restore session state: {exc}", file=sys.stderr)

stdout_capture = io.StringIO()
stderr_capture = io.StringIO()
error = None
try:
    with redirect_stdout(stdout_capture), redirect_stderr(stderr_capture):
        exec(compile(CODE, "<session>", "exec"), namespace)
except BaseException:
    error = traceback.format_exc()

to_save = {}
for key, value in namespace.items():
    if not exportable(key, value):
        continue
    try:
        pickle.dumps(value)
    except Exception:
        continue
    to_save[key] = value

try:
    with open(SESSION_PATH + ".tmp", "wb") as handle:
        pickle.dump(to_save, handle)
    os.replace(SESSION_PATH + ".tmp", SESSION_PATH)
except Exception as exc:
    print(f"could not save session state: {exc}", file=sys.stderr)

payload = {
    "output": stdout_capture.getvalue(),
    "stderr": stderr_capture.getvalue(),
    "error": error,
    "state": {key: ensure_serializable(value) for key, value in to_save.items()},
}
if "result" in namespace:
    payload["result"] = ensure_serializable(namespace["result"])

print("---OUTPUT_START---")
print(json.dumps(payload))
print("---OUTPUT_END---")
"#;

/// Join a file name onto the container working directory
fn in_working_dir(working_dir: &str, file: &str) -> String {
    format!("{}/{}", working_dir.trim_end_matches('/'), file)
}

pub fn script_path(working_dir: &str) -> String {
    in_working_dir(working_dir, SCRIPT_FILE)
}

pub fn state_path(working_dir: &str) -> String {
    in_working_dir(working_dir, STATE_FILE)
}

pub fn output_path(working_dir: &str) -> String {
    in_working_dir(working_dir, OUTPUT_FILE)
}

pub fn session_state_path(working_dir: &str) -> String {
    in_working_dir(working_dir, SESSION_STATE_FILE)
}

/// Encode a string as a Python string literal
///
/// JSON string syntax is a subset of Python's, including `\uXXXX` escapes.
fn py_literal(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Wrapper for a one-shot run exchanging state through `state.json`/`output.json`
pub fn transient_script(config: &SandboxConfig, code: &str) -> String {
    let wd = &config.docker.working_dir;
    TRANSIENT_TEMPLATE
        .replace("__PYSANDBOX_HELPERS__", SHARED_HELPERS)
        .replace("__PYSANDBOX_STATE_PATH__", &py_literal(&state_path(wd)))
        .replace("__PYSANDBOX_OUTPUT_PATH__", &py_literal(&output_path(wd)))
        // code goes in last so its contents are never rewritten
        .replace("__PYSANDBOX_CODE__", &py_literal(code))
}

/// Wrapper for one call in a persistent session, printing a delimited payload
pub fn persistent_script(config: &SandboxConfig, code: &str) -> String {
    let wd = &config.docker.working_dir;
    PERSISTENT_TEMPLATE
        .replace("__PYSANDBOX_HELPERS__", SHARED_HELPERS)
        .replace("__PYSANDBOX_SESSION_PATH__", &py_literal(&session_state_path(wd)))
        .replace("__PYSANDBOX_CODE__", &py_literal(code))
}
