use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::compile::{COMPILE_TIMEOUT, Gcc};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "netlab-eval",
    about = "Grade networking submissions against scripted test cases"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Evaluate a client program against a scripted peer server
    Client(EvalOpts),
    /// Evaluate a server program with driver clients
    Server(EvalOpts),
}

impl Cmd {
    pub fn opts(&self) -> &EvalOpts {
        match self {
            Cmd::Client(o) | Cmd::Server(o) => o,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CompilerOpts {
    /// C compiler to invoke
    #[arg(long, default_value = "gcc")]
    pub compiler: String,
    /// Extra compiler flags, whitespace separated
    #[arg(long, default_value = "-Wall", allow_hyphen_values = true)]
    pub cflags: String,
}

impl CompilerOpts {
    pub fn gcc(&self) -> Gcc {
        Gcc {
            program: self.compiler.clone(),
            flags: self.cflags.split_whitespace().map(String::from).collect(),
            timeout: COMPILE_TIMEOUT,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct EvalOpts {
    /// C source file of the submission
    pub source: PathBuf,
    /// JSON file holding the test cases
    pub tests: PathBuf,
    /// Index of the test case to run
    pub index: usize,
    #[command(flatten)]
    pub cc: CompilerOpts,
    /// Directory for patched sources and binaries (default: system temp)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
    /// Verbose logging on stderr
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_args_and_defaults() {
        let cli = Cli::parse_from(["netlab-eval", "server", "srv.c", "tests.json", "3"]);
        let Cmd::Server(o) = &cli.cmd else {
            panic!("expected server subcommand");
        };
        assert_eq!(o.index, 3);
        assert_eq!(o.source, PathBuf::from("srv.c"));
        assert!(!o.debug);
        let gcc = o.cc.gcc();
        assert_eq!(gcc.program, "gcc");
        assert_eq!(gcc.flags, vec!["-Wall"]);
    }

    #[test]
    fn cflags_split_on_whitespace() {
        let cli = Cli::parse_from([
            "netlab-eval",
            "client",
            "--cflags",
            "-O2 -pthread",
            "--compiler",
            "clang",
            "c.c",
            "t.json",
            "0",
        ]);
        let gcc = cli.cmd.opts().cc.gcc();
        assert_eq!(gcc.program, "clang");
        assert_eq!(gcc.flags, vec!["-O2", "-pthread"]);
    }
}
