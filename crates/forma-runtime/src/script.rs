//! Finalizes a generated script for isolated execution.
//!
//! The preamble clears any previous exports for the slot and replaces the
//! interactive `show_object` call with one that writes the object to all
//! three formats. Paths enter the program as escaped quoted literals,
//! never by splicing raw text into the template.

use std::path::Path;

use crate::artifacts::ArtifactPaths;

/// Encode a filesystem path as a Python string literal.
fn python_string_literal(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut literal = String::with_capacity(raw.len() + 2);
    literal.push('"');
    for ch in raw.chars() {
        match ch {
            '\\' => literal.push_str("\\\\"),
            '"' => literal.push_str("\\\""),
            '\n' => literal.push_str("\\n"),
            '\r' => literal.push_str("\\r"),
            _ => literal.push(ch),
        }
    }
    literal.push('"');
    literal
}

/// Prepend the export preamble to a generated script.
pub fn finalize_script(code: &str, paths: &ArtifactPaths) -> String {
    let model = python_string_literal(&paths.model);
    let mesh = python_string_literal(&paths.mesh);
    let interchange = python_string_literal(&paths.interchange);

    let mut program = String::new();
    program.push_str("import os\n\n");
    program.push_str("_FORMA_EXPORTS = [\n");
    program.push_str(&format!("    (\"THREEMF\", {model}),\n"));
    program.push_str(&format!("    (\"STL\", {mesh}),\n"));
    program.push_str(&format!("    (\"STEP\", {interchange}),\n"));
    program.push_str("]\n\n");
    program.push_str(
        "for _kind, _path in _FORMA_EXPORTS:\n\
         \x20   if os.path.exists(_path):\n\
         \x20       os.remove(_path)\n\
         \x20       print(f\"removed stale export: {_path}\")\n\n",
    );
    program.push_str(
        "def show_object(obj, name=None, options=None, parent=None, **kwargs):\n\
         \x20   from cadquery import exporters\n\
         \x20   for kind, path in _FORMA_EXPORTS:\n\
         \x20       exporters.export(obj, path, getattr(exporters.ExportTypes, kind))\n\n",
    );
    program.push_str(code);
    program
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn paths() -> ArtifactPaths {
        ArtifactPaths {
            model: PathBuf::from("/tmp/out/123.3mf"),
            mesh: PathBuf::from("/tmp/out/123.stl"),
            interchange: PathBuf::from("/tmp/out/123.step"),
        }
    }

    #[test]
    fn preamble_names_all_three_export_paths() {
        let program = finalize_script("result = 1\n", &paths());
        assert!(program.contains("\"/tmp/out/123.3mf\""));
        assert!(program.contains("\"/tmp/out/123.stl\""));
        assert!(program.contains("\"/tmp/out/123.step\""));
    }

    #[test]
    fn user_code_follows_the_preamble() {
        let program = finalize_script("show_object(result)\n", &paths());
        let def_at = program.find("def show_object").expect("redefinition");
        let call_at = program.rfind("show_object(result)").expect("user call");
        assert!(def_at < call_at);
    }

    #[test]
    fn paths_with_quotes_are_escaped_not_spliced() {
        let tricky = ArtifactPaths {
            model: PathBuf::from("/tmp/we\"ird/1.3mf"),
            mesh: PathBuf::from("/tmp/we\"ird/1.stl"),
            interchange: PathBuf::from("/tmp/we\"ird/1.step"),
        };
        let program = finalize_script("pass\n", &tricky);
        assert!(program.contains("we\\\"ird"));
        assert!(!program.contains("\"/tmp/we\"ird/1.3mf\""));
    }

    #[test]
    fn stale_exports_are_cleared_before_user_code_runs() {
        let program = finalize_script("result = 1\n", &paths());
        let clear_at = program.find("os.remove(_path)").expect("clear loop");
        let user_at = program.rfind("result = 1").expect("user code");
        assert!(clear_at < user_at);
    }
}
