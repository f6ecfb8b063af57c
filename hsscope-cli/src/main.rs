//! hsscope CLI - コマンドラインインターフェース
//!
//! 停止させたHaskellプログラムのスレッドとスタックを調べるREPLと、
//! 一度だけ表示して終了するサブコマンドを提供します。

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use hsscope_core::{
    Command, Inspector, ListOptions, ProfileOptions, RegistryConfig, Symbol, WalkConfig,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{self, Write};
use tracing_subscriber::EnvFilter;

/// hsscope - GHC RTS thread inspector
#[derive(Parser)]
#[command(name = "hsscope")]
#[command(version)]
#[command(about = "Inspect threads and stacks of a stopped Haskell program", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: InspectCommand,

    /// Maximum number of links followed in one thread list
    #[arg(long, global = true, default_value_t = 1_000_000, value_parser = clap::value_parser!(u64).range(1..))]
    max_links: u64,

    /// Maximum number of frames walked per thread
    #[arg(long, global = true, default_value_t = 1_000_000, value_parser = clap::value_parser!(u64).range(1..))]
    max_frames: u64,
}

#[derive(Args)]
struct Target {
    /// Path to the executable binary
    binary: String,

    /// Process ID to attach to
    #[arg(short, long)]
    pid: i32,
}

#[derive(Subcommand)]
enum InspectCommand {
    /// Attach to a process and start an interactive session
    Attach {
        #[command(flatten)]
        target: Target,
    },

    /// Print every thread with its stack and exit
    Tsos {
        #[command(flatten)]
        target: Target,

        /// Only threads that are currently running
        #[arg(short, long)]
        running: bool,

        /// One line per frame
        #[arg(short, long)]
        compact: bool,
    },

    /// Print one profile line per running thread and exit
    Profile {
        #[command(flatten)]
        target: Target,

        /// Keep unresolved and RTS-internal frames
        #[arg(short, long)]
        verbose: bool,

        /// Collapse adjacent repeated names
        #[arg(short, long)]
        unique: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let registry_config = RegistryConfig {
        max_links: cli.max_links as usize,
    };
    let walk_config = WalkConfig {
        max_frames: cli.max_frames as usize,
    };
    let inspector = Inspector::new().with_limits(registry_config, walk_config);

    match cli.command {
        InspectCommand::Attach { target } => {
            let mut inspector = init_inspector(inspector, &target)?;
            println!("Attached to process {}", target.pid);
            println!();
            run_repl(&mut inspector)?;
        }
        InspectCommand::Tsos {
            target,
            running,
            compact,
        } => {
            let inspector = init_inspector(inspector, &target)?;
            let options = ListOptions {
                running_only: running,
                compact,
            };
            inspector.list_threads(&mut io::stdout().lock(), options)?;
        }
        InspectCommand::Profile {
            target,
            verbose,
            unique,
        } => {
            let inspector = init_inspector(inspector, &target)?;
            inspector.profile(&mut io::stdout().lock(), ProfileOptions { verbose, unique })?;
        }
    }

    Ok(())
}

/// ログ出力を初期化する（RUST_LOG、既定はwarn）
///
/// コマンドの出力と混ざらないようにstderrへ書く。
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// バイナリを読み込んでプロセスにアタッチする
fn init_inspector(mut inspector: Inspector, target: &Target) -> Result<Inspector> {
    inspector.load_binary(&target.binary)?;
    tracing::info!("loaded debug information from {}", target.binary);

    inspector.attach(target.pid)?;
    tracing::info!("attached to process {}", target.pid);

    Ok(inspector)
}

/// REPLループを実行する
fn run_repl(inspector: &mut Inspector) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(hsscope) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match handle_command(inspector, line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

/// シンボルリストを表示するヘルパー関数
fn print_symbol_list(title: &str, symbols: &[Symbol], limit: Option<usize>) {
    if symbols.is_empty() {
        println!("No {} found", title);
        return;
    }

    let display_limit = limit.unwrap_or(symbols.len());
    println!("{} ({} found):", title, symbols.len());

    for (i, sym) in symbols.iter().take(display_limit).enumerate() {
        let decoded = hsscope_core::clean_name(&sym.name);
        if decoded != sym.name {
            println!("  {}. {} ({}) @ 0x{:x}", i + 1, decoded, sym.name, sym.address);
        } else {
            println!("  {}. {} @ 0x{:x}", i + 1, sym.name, sym.address);
        }
    }

    if symbols.len() > display_limit {
        println!("  ... and {} more", symbols.len() - display_limit);
    }
}

/// 1行のコマンドを実行する。終了する場合は`false`を返す
fn handle_command(inspector: &mut Inspector, line: &str) -> Result<bool> {
    let Some(command) = Command::parse(line)? else {
        return Ok(true);
    };

    let mut out = io::stdout().lock();
    match command {
        Command::InfoTsos(options) => inspector.list_threads(&mut out, options)?,
        Command::InfoTsoProfile(options) => inspector.profile(&mut out, options)?,
        Command::Find(pattern) => {
            let symbols = inspector.find_symbols(&pattern)?;
            let title = format!("Symbols matching '{}'", pattern);
            print_symbol_list(&title, &symbols, Some(20));
        }
        Command::Name(pc) => {
            let (name, pretty) = inspector.function_name(pc)?;
            writeln!(out, "0x{:x}: {} ({})", pc, name, pretty)?;
        }
        Command::Help => print_help(),
        Command::Quit => {
            println!("Goodbye!");
            return Ok(false);
        }
    }
    out.flush()?;

    Ok(true)
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help              - Show this help message");
    println!("  quit/exit/q       - Detach and exit");
    println!();
    println!("Thread commands:");
    println!("  info tsos [-r] [-c]");
    println!("                    - Show every thread and its stack");
    println!("                      -r: running threads only, -c: one line per frame");
    println!("  info tsoprofile [-v] [-u]");
    println!("                    - One profile line per running thread");
    println!("                      -v: keep unknown and RTS frames, -u: collapse repeats");
    println!();
    println!("Symbol commands:");
    println!("  find <pattern>    - Find symbols matching pattern (raw or decoded)");
    println!("  name <address>    - Show the function name at a code address");
    println!();
    println!("Examples:");
    println!("  info tsos -c");
    println!("  info tsoprofile -u");
    println!("  find GHC.Base.map");
    println!("  name 0x4a1f20");
}
