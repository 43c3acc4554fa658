use crate::errors::Result;
use crate::workspace::Workspace;
use std::fs::File;
use std::io::{BufWriter, Write};

/// Where the input directory is mounted inside the environment (read-only)
pub const INPUT_MOUNT: &str = "/inputs";
/// Where the output directory is mounted inside the environment (read-write)
pub const OUTPUT_MOUNT: &str = "/outputs";

pub const BOOTSTRAP_FILE: &str = "bootstrap.py";
pub const CODE_FILE: &str = "code.py";

/// Fixed program executed before generated code.
///
/// It binds the marshaled variables by name, runs the generated code under an
/// exception-capturing scope, and writes `.codegen/result.json` plus the
/// declared-output manifest before the process exits.
pub const BOOTSTRAP_SOURCE: &str = r##"
import builtins
import json
import keyword
import os
import sys
import time
import traceback

INPUT_DIR = os.environ.get("CODEGEN_INPUT_DIR", "/inputs")
OUTPUT_DIR = os.environ.get("CODEGEN_OUTPUT_DIR", "/outputs")
RESERVED_DIR = os.path.join(OUTPUT_DIR, ".codegen")
DECLARED_DIR = os.path.join(RESERVED_DIR, "vars")
SUMMARY_PATH = os.path.join(RESERVED_DIR, "result.json")

try:
    import pandas as _pd
except Exception:
    _pd = None

_declared = []
_RESERVED_NAMES = {"declare_output"}


def _series_for(dtype, values):
    missing = any(v is None for v in values)
    if dtype == "int":
        return _pd.Series(values, dtype="Int64" if missing else "int64")
    if dtype == "bool":
        return _pd.Series(values, dtype="boolean" if missing else "bool")
    if dtype == "float":
        return _pd.Series([float("nan") if v is None else v for v in values], dtype="float64")
    return _pd.Series(values, dtype=object)


def _load_table(path):
    with open(path, "r", encoding="utf-8") as fh:
        payload = json.load(fh)
    columns = payload.get("columns", [])
    if _pd is None:
        return {col["name"]: col["values"] for col in columns}
    return _pd.DataFrame({col["name"]: _series_for(col["dtype"], col["values"]) for col in columns})


def _is_missing(value):
    if value is None:
        return True
    try:
        return bool(_pd.isna(value))
    except (TypeError, ValueError):
        return False


def _column_payload(name, series):
    kind = series.dtype.kind
    values = [None if _is_missing(v) else v for v in series.tolist()]
    if kind in "iu":
        dtype, convert = "int", int
    elif kind == "f":
        dtype, convert = "float", float
    elif kind == "b":
        dtype, convert = "bool", bool
    else:
        dtype, convert = "str", str
    return {
        "dtype": dtype,
        "name": str(name),
        "values": [None if v is None else convert(v) for v in values],
    }


def _json_default(obj):
    if hasattr(obj, "item") and callable(obj.item):
        return obj.item()
    if hasattr(obj, "tolist") and callable(obj.tolist):
        return obj.tolist()
    raise TypeError(f"Object of type {type(obj).__name__} is not JSON serializable")


def declare_output(name, value):
    """Hand `value` back to the host under `name`."""
    if not isinstance(name, str) or not name.isascii() or not name.isidentifier():
        raise ValueError(f"output name {name!r} is not an identifier")
    if keyword.iskeyword(name):
        raise ValueError(f"output name {name!r} is a Python keyword")
    if name in _RESERVED_NAMES or (name.startswith("__") and name.endswith("__")):
        raise ValueError(f"output name {name!r} is reserved by the sandbox")
    os.makedirs(DECLARED_DIR, exist_ok=True)
    if isinstance(value, (bytes, bytearray, memoryview)):
        kind, file_name = "bytes", name + ".bin"
        with open(os.path.join(DECLARED_DIR, file_name), "wb") as fh:
            fh.write(bytes(value))
    elif _pd is not None and isinstance(value, _pd.DataFrame):
        kind, file_name = "table", name + ".table.json"
        payload = {
            "columns": [
                _column_payload(col, value.iloc[:, i]) for i, col in enumerate(value.columns)
            ]
        }
        with open(os.path.join(DECLARED_DIR, file_name), "w", encoding="utf-8") as fh:
            json.dump(payload, fh, allow_nan=False)
    else:
        try:
            text = json.dumps(value, allow_nan=False, default=_json_default)
        except (TypeError, ValueError) as exc:
            raise TypeError(f"output {name!r} cannot be declared: {exc}") from None
        kind, file_name = "json", name + ".json"
        with open(os.path.join(DECLARED_DIR, file_name), "w", encoding="utf-8") as fh:
            fh.write(text)
    _declared[:] = [entry for entry in _declared if entry["name"] != name]
    _declared.append({"name": name, "kind": kind, "file": file_name})


def _bind_inputs(scope):
    vars_dir = os.path.join(INPUT_DIR, "vars")
    manifest_path = os.path.join(vars_dir, "manifest.json")
    if not os.path.exists(manifest_path):
        return
    with open(manifest_path, "r", encoding="utf-8") as fh:
        manifest = json.load(fh)
    for entry in manifest.get("variables", []):
        path = os.path.join(vars_dir, entry["file"])
        if entry["kind"] == "bytes":
            with open(path, "rb") as fh:
                value = fh.read()
        elif entry["kind"] == "table":
            value = _load_table(path)
        else:
            with open(path, "r", encoding="utf-8") as fh:
                value = json.load(fh)
        scope[entry["name"]] = value


def _write_summary(summary):
    os.makedirs(DECLARED_DIR, exist_ok=True)
    with open(os.path.join(DECLARED_DIR, "manifest.json"), "w", encoding="utf-8") as fh:
        json.dump({"version": 1, "variables": _declared}, fh)
    with open(SUMMARY_PATH, "w", encoding="utf-8") as fh:
        json.dump(summary, fh)


def main():
    started = time.monotonic()
    scope = {
        "__name__": "__main__",
        "__builtins__": builtins,
        "declare_output": declare_output,
    }
    summary = {"status": "ok", "exit_code": 0, "exception": None, "declared_outputs": []}
    try:
        _bind_inputs(scope)
        with open(os.path.join(INPUT_DIR, "code.py"), "r", encoding="utf-8") as fh:
            source = fh.read()
        exec(compile(source, "<generated>", "exec"), scope)
    except SystemExit as exc:
        code = exc.code
        if code is None:
            code = 0
        elif not isinstance(code, int):
            print(code, file=sys.stderr)
            code = 1
        summary["status"] = "exited"
        summary["exit_code"] = code
    except BaseException as exc:
        trace = traceback.format_exc()
        sys.stderr.write(trace)
        summary["status"] = "raised"
        summary["exit_code"] = 1
        summary["exception"] = {
            "type": type(exc).__name__,
            "message": str(exc),
            "traceback": trace,
        }
    summary["declared_outputs"] = [entry["name"] for entry in _declared]
    summary["elapsed_ms"] = int((time.monotonic() - started) * 1000)
    try:
        _write_summary(summary)
    except Exception:
        traceback.print_exc()
    sys.stdout.flush()
    sys.stderr.flush()
    os._exit(summary["exit_code"] & 0xFF)


main()
"##;

/// Command that starts the bootstrap inside the environment
pub fn entry_command() -> Vec<String> {
    vec![
        "python".to_string(),
        "-u".to_string(),
        format!("{}/{}", INPUT_MOUNT, BOOTSTRAP_FILE),
    ]
}

/// Place the bootstrap and the generated code into the input directory.
///
/// The code is written verbatim as data; nothing here interprets it.
pub fn install(workspace: &Workspace, code: &str) -> Result<()> {
    let input_dir = workspace.input_dir();
    std::fs::write(input_dir.join(BOOTSTRAP_FILE), BOOTSTRAP_SOURCE)?;

    let mut writer = BufWriter::new(File::create(input_dir.join(CODE_FILE))?);
    writer.write_all(code.as_bytes())?;
    writer.flush()?;
    Ok(())
}
