use std::{env, path::Path, process::ExitCode};

use muscat::{InterpretError, Vm};

const USAGE: &str = "usage: muscat [--load-path <dir>]... [--disasm] <file.msc> [args...]";

struct Options {
    load_paths: Vec<String>,
    disasm: bool,
    file: String,
    program_args: Vec<String>,
}

fn main() -> ExitCode {
    let options = match parse_args(env::args().skip(1).collect()) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    let mut vm = Vm::new(options.program_args);
    // Modules resolve relative to the script's directory by default.
    if let Some(parent) = Path::new(&options.file).parent() {
        vm.add_load_path(parent.to_path_buf());
    }
    for path in &options.load_paths {
        vm.add_load_path(path.clone());
    }
    if let Err(e) = vm.register_core_modules() {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    if options.disasm {
        let source = match std::fs::read_to_string(&options.file) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("error: could not read {}: {e}", options.file);
                return ExitCode::FAILURE;
            }
        };
        match vm.disassemble_source(&source, Some(&options.file)) {
            Ok(listing) => {
                print!("{listing}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        }
    } else {
        match vm.eval_file(&options.file) {
            Ok(_) => ExitCode::SUCCESS,
            Err(InterpretError::Compile(e)) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
            Err(InterpretError::Runtime(e)) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        }
    }
}

fn parse_args(args: Vec<String>) -> Result<Options, String> {
    let mut load_paths = Vec::new();
    let mut disasm = false;

    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--load-path" => {
                index += 1;
                let path = args
                    .get(index)
                    .ok_or_else(|| "error: --load-path requires a directory".to_string())?;
                load_paths.push(path.clone());
            }
            "--disasm" => disasm = true,
            _ => break,
        }
        index += 1;
    }

    let file = args
        .get(index)
        .cloned()
        .ok_or_else(|| "error: no input file".to_string())?;
    Ok(Options {
        load_paths,
        disasm,
        file,
        program_args: args[index + 1..].to_vec(),
    })
}
