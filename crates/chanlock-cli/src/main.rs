use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use fs2::FileExt;

use chanlock_core::{
    Backend, CancelFlag, ExecContext, Executor, GitRefLookup, ReconcileMode, Result, State,
    StatePaths, StoreRoot, SystemRunner,
};

mod args;
use args::{Cli, Commands, Shell};

static CANCELLED: AtomicBool = AtomicBool::new(false);

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let result = match &cli.command {
        Some(Commands::Completions { shell }) => {
            handle_completions(*shell);
            Ok(())
        }
        _ => run(&cli),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "[ERROR]".red().bold(), e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("chanlock={level},chanlock_core={level}"))
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(cli: &Cli) -> Result<()> {
    let _guard = acquire_run_lock()?;
    install_sigint_handler();

    let paths = StatePaths::new(
        resolve_config(cli.config.clone()),
        cli.lock_file.clone(),
        cli.registry_file.clone(),
    );

    let runner = SystemRunner;
    let ctx = ExecContext::detect()?
        .with_verbose(cli.verbose > 0)
        .with_cancel(CancelFlag::from_static(&CANCELLED));
    let exec = Executor::new(&runner, &ctx);
    let lookup = GitRefLookup::new(exec);
    let store_root = StoreRoot::new();
    let backend = Backend {
        exec,
        lookup: &lookup,
        store_root: &store_root,
    };

    let mut state = State::load(&paths)?;
    let user = |user: &Option<String>| user.clone().unwrap_or_else(|| ctx.current_user.clone());

    match &cli.command {
        Some(Commands::IncludeFlags { user: u }) => {
            let flags = state.include_flags(&backend, &user(u))?;
            println!("{}", flags.join(" "));
            Ok(())
        }
        Some(Commands::StorePath { channel, user: u }) => {
            let path = state.store_path(&backend, &user(u), channel)?;
            println!("{}", path);
            Ok(())
        }
        Some(Commands::Rollback { user: u }) => {
            let username = user(u);
            state.rollback(&backend, &username)?;
            if !cli.quiet {
                println!("{} {}", "Rolled back:".green(), username);
            }
            Ok(())
        }
        Some(Commands::Completions { .. }) => Ok(()),
        None => handle_sync(cli, &mut state, &backend, &paths),
    }
}

fn handle_sync(cli: &Cli, state: &mut State, backend: &Backend<'_>, paths: &StatePaths) -> Result<()> {
    if !cli.channels.is_empty() && state.config.filter_channels(&cli.channels).channel_count() == 0 {
        println!("no channels to update");
        return Ok(());
    }

    let mode = if cli.update {
        ReconcileMode::FullUpdate
    } else if cli.update_locks {
        ReconcileMode::LocksOnly
    } else {
        ReconcileMode::MissingOnly
    };

    let changes = state.update(backend, mode, &cli.channels, cli.allow_hash_update)?;
    let applied = state.apply(backend)?;
    let registry = state.registry(backend)?;
    state.save(paths, registry.as_ref())?;

    if cli.quiet {
        return Ok(());
    }

    for input in &changes.changed {
        println!("{} {}", "Locked:".green(), input);
    }
    for (username, result) in &applied {
        if result.added.is_empty() && result.pruned.is_empty() {
            continue;
        }
        println!("{}", username.cyan().bold());
        for name in &result.added {
            println!("  {} {}", "+".green(), name);
        }
        for name in &result.pruned {
            println!("  {} {}", "-".red(), name);
        }
    }
    if registry.is_some() {
        println!("{} {}", "Registry:".green(), paths.registry.display());
    }
    if changes.is_empty() {
        println!("{}", "Lock file up to date".dimmed());
    }
    Ok(())
}

fn handle_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let shell = match shell {
        Shell::Bash => clap_complete::Shell::Bash,
        Shell::Zsh => clap_complete::Shell::Zsh,
        Shell::Fish => clap_complete::Shell::Fish,
        Shell::PowerShell => clap_complete::Shell::PowerShell,
        Shell::Elvish => clap_complete::Shell::Elvish,
    };
    generate(shell, &mut cmd, "chanlock", &mut io::stdout());
}

/// `./<hostname>.toml` unless a path was given
fn resolve_config(cli_config: Option<PathBuf>) -> PathBuf {
    cli_config.unwrap_or_else(|| {
        let mut name = gethostname::gethostname();
        name.push(".toml");
        PathBuf::from(name)
    })
}

/// Only one run at a time may touch channels
fn acquire_run_lock() -> Result<File> {
    let path = std::env::temp_dir().join("chanlock.lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            format!("another chanlock run holds {}", path.display()),
        )
        .into()),
        Err(e) => Err(e.into()),
    }
}

/// Ctrl-C only raises the flag; commands in flight notice it and stop
fn install_sigint_handler() {
    if let Err(e) = ctrlc::set_handler(|| CANCELLED.store(true, Ordering::SeqCst)) {
        tracing::warn!(error = %e, "cannot install Ctrl-C handler");
    }
}
