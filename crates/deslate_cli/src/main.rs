use clap::{CommandFactory, Parser};

use crate::cli::{Cli, DecompileCommand, DecompileModeCli, TopLevel};

mod cli;

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File { path, mode } => {
                let mode = match mode {
                    DecompileModeCli::Source => deslate_lib::DecompileMode::Source,
                    DecompileModeCli::Disasm => deslate_lib::DecompileMode::Disasm,
                };
                match std::fs::read(&path) {
                    Ok(bytes) => {
                        let mut out = Vec::new();
                        match deslate_lib::decompile_container_with_options(
                            &bytes[..],
                            &mut out,
                            deslate_lib::DecompileOptions { mode },
                        ) {
                            Ok(()) => {
                                print!("{}", String::from_utf8_lossy(&out));
                            }
                            Err(e) => {
                                eprintln!("decompile error: {e}");
                                std::process::exit(1);
                            }
                        }
                    }
                    Err(e) => {
                        eprintln!("failed to read {path:?}: {e}");
                        std::process::exit(1);
                    }
                }
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            Cli::command().print_help().unwrap();
        }
    }
}
