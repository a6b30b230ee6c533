//! Port patching and compilation of C submissions.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use regex::{NoExpand, Regex};
use tracing::{debug, info, warn};

use crate::error::{EvalError, Result};
use crate::process::{Pipe, wait_timeout};

pub const COMPILE_TIMEOUT: Duration = Duration::from_secs(10);

/// Port declarations recognised in submissions, with their replacement.
static PORT_DECLS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"#define\s+PORT\s+\d+", "#define PORT"),
        (r"const\s+int\s+port\s*=\s*\d+", "const int port ="),
        (r"\bint\s+port\s*=\s*\d+", "int port ="),
    ]
    .into_iter()
    .filter_map(|(re, lead)| Regex::new(re).ok().map(|re| (re, lead)))
    .collect()
});

static FIRST_INCLUDE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"#include\s+<[^>]+>").ok());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patched {
    pub source: String,
    /// False when no port declaration was found and one was inserted.
    pub matched: bool,
}

/// Rewrite the port constant of `source` to `port`.
///
/// A custom `pattern` is tried first and replaced by `#define PORT <port>`.
/// Then the built-in declarations. When nothing matches a `#define PORT`
/// is inserted after the first system include, or at the top.
pub fn patch_port(source: &str, pattern: Option<&str>, port: u16) -> Patched {
    if let Some(pat) = pattern {
        match Regex::new(pat) {
            Ok(re) if re.is_match(source) => {
                let line = format!("#define PORT {port}");
                return Patched {
                    source: re.replace_all(source, NoExpand(&line)).into_owned(),
                    matched: true,
                };
            }
            Ok(_) => debug!(pattern = pat, "custom port pattern not found"),
            Err(e) => warn!(pattern = pat, error = %e, "invalid port pattern, using defaults"),
        }
    }

    // Only the first declaration form found is rewritten.
    if let Some((re, lead)) = PORT_DECLS.iter().find(|(re, _)| re.is_match(source)) {
        let line = format!("{lead} {port}");
        return Patched {
            source: re.replace_all(source, NoExpand(&line)).into_owned(),
            matched: true,
        };
    }

    warn!(port, "no port declaration found, inserting #define PORT");
    let define = format!("\n#define PORT {port}\n");
    let insert_at = FIRST_INCLUDE
        .as_ref()
        .and_then(|re| re.find(source))
        .map(|m| m.end());
    let source = match insert_at {
        Some(at) => format!("{}{}{}", &source[..at], define, &source[at..]),
        None => format!("{}{}", define.trim_start(), source),
    };
    Patched {
        source,
        matched: false,
    }
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub binary: PathBuf,
    /// Compiler diagnostics, warnings included.
    pub diagnostics: String,
}

pub trait Compiler {
    fn compile(&self, src: &Path, out: &Path) -> Result<CompileOutput>;
}

/// `<program> <src> -o <out> <flags...>`
#[derive(Debug, Clone)]
pub struct Gcc {
    pub program: String,
    pub flags: Vec<String>,
    pub timeout: Duration,
}

impl Default for Gcc {
    fn default() -> Self {
        Self {
            program: "gcc".into(),
            flags: vec!["-Wall".into()],
            timeout: COMPILE_TIMEOUT,
        }
    }
}

impl Compiler for Gcc {
    fn compile(&self, src: &Path, out: &Path) -> Result<CompileOutput> {
        info!(program = %self.program, src = %src.display(), "compiling");
        let mut child = Command::new(&self.program)
            .arg(src)
            .arg("-o")
            .arg(out)
            .args(&self.flags)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EvalError::Compile(format!("could not run {}: {e}", self.program)))?;
        let stderr = match child.stderr.take() {
            Some(err) => Pipe::spawn(err, "cc-stderr")?,
            None => return Err(EvalError::Compile("compiler stderr not captured".into())),
        };

        let Some(status) = wait_timeout(&mut child, self.timeout)? else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EvalError::Compile(format!(
                "compiler timed out after {}s",
                self.timeout.as_secs()
            )));
        };
        let diagnostics = stderr.drain(Duration::from_secs(1));
        if !status.success() {
            return Err(EvalError::Compile(diagnostics.trim().to_string()));
        }
        Ok(CompileOutput {
            binary: out.to_path_buf(),
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_is_rewritten() {
        let p = patch_port("#include <stdio.h>\n#define PORT 8080\nint main(){}", None, 12345);
        assert!(p.matched);
        assert!(p.source.contains("#define PORT 12345"));
        assert!(!p.source.contains("8080"));
    }

    #[test]
    fn int_and_const_int_forms() {
        let p = patch_port("int port = 8080;", None, 4000);
        assert_eq!(p.source, "int port = 4000;");
        let p = patch_port("static const int port = 9000;", None, 4001);
        assert_eq!(p.source, "static const int port = 4001;");
    }

    #[test]
    fn only_the_first_declaration_form_is_rewritten() {
        let src = "#define PORT 8080\nint port = 0;\n";
        let p = patch_port(src, None, 6000);
        assert!(p.matched);
        assert_eq!(p.source, "#define PORT 6000\nint port = 0;\n");
    }

    #[test]
    fn custom_pattern_wins() {
        let src = "#define SERVER_PORT 7000\n";
        let p = patch_port(src, Some(r"#define\s+SERVER_PORT\s+\d+"), 7100);
        assert!(p.matched);
        assert_eq!(p.source, "#define PORT 7100\n");
    }

    #[test]
    fn invalid_custom_pattern_falls_back() {
        let p = patch_port("#define PORT 1\n", Some("(unclosed"), 2);
        assert!(p.matched);
        assert_eq!(p.source, "#define PORT 2\n");
    }

    #[test]
    fn missing_declaration_is_inserted_after_include() {
        let p = patch_port("#include <stdio.h>\nint main(){}", None, 5000);
        assert!(!p.matched);
        assert_eq!(
            p.source,
            "#include <stdio.h>\n#define PORT 5000\n\nint main(){}"
        );
        let p = patch_port("int main(){}", None, 5001);
        assert!(p.source.starts_with("#define PORT 5001\n"));
    }

    #[cfg(unix)]
    #[test]
    fn warnings_are_kept_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let cc = crate::process::testutil::script(
            dir.path(),
            "cc",
            "echo 'x.c:2: warning: unused variable' >&2; exit 0",
        );
        let gcc = Gcc {
            program: cc.display().to_string(),
            ..Default::default()
        };
        let out = gcc
            .compile(&dir.path().join("x.c"), &dir.path().join("x"))
            .unwrap();
        assert_eq!(out.binary, dir.path().join("x"));
        assert_eq!(out.diagnostics.trim(), "x.c:2: warning: unused variable");
    }

    #[cfg(unix)]
    #[test]
    fn failing_compiler_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let cc = crate::process::testutil::script(dir.path(), "cc", "echo 'x.c:1: error' >&2; exit 1");
        let gcc = Gcc {
            program: cc.display().to_string(),
            ..Default::default()
        };
        let err = gcc
            .compile(&dir.path().join("x.c"), &dir.path().join("x"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Compilation failed: x.c:1: error");
    }

    #[test]
    fn missing_compiler_is_a_compile_error() {
        let gcc = Gcc {
            program: "/nonexistent/cc".into(),
            ..Default::default()
        };
        let err = gcc.compile(Path::new("a.c"), Path::new("a")).unwrap_err();
        assert!(matches!(err, EvalError::Compile(_)));
    }
}
