use std::fs::File;
use std::io;
use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::Duration;

use russ::Attributes;
use russ::Dialer;
use russ::Listener;
use russ::RussConfig;
use russ::Server;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::commands::Cli;
use crate::commands::Commands;
use crate::echo;
use crate::error::CliError;
use crate::signal_handler::SignalHandler;

pub type HandlerResult = Result<i32, CliError>;

/// Runs the parsed command line, returning the process exit status.
pub fn run(cli: Cli) -> HandlerResult {
    let mut config = RussConfig::from_env();
    if let Some(dir) = cli.services_dir {
        config = config.with_services_dir(dir);
    }
    let default_timeout = config.dial_timeout;

    match cli.command {
        Commands::Dial {
            addr,
            op,
            args,
            attributes,
            timeout,
        } => {
            let dialer = Dialer::new(config);
            handle_dial(
                &dialer,
                &addr,
                &op,
                &args,
                attributes.into_iter().collect(),
                timeout.or(default_timeout),
            )
        }
        Commands::Help { addr, timeout } => {
            let text = Dialer::new(config).help(&addr, timeout.or(default_timeout))?;
            print_reply(&text)
        }
        Commands::Info { addr, timeout } => {
            let text = Dialer::new(config).info(&addr, timeout.or(default_timeout))?;
            print_reply(&text)
        }
        Commands::List { addr, timeout } => {
            let text = Dialer::new(config).list(&addr, timeout.or(default_timeout))?;
            print_reply(&text)
        }
        Commands::Serve {
            path,
            mode,
            workers,
        } => {
            if let Some(n) = workers {
                config = config.with_workers(n);
            }
            handle_serve(config, &path, mode)
        }
    }
}

fn print_reply(text: &str) -> HandlerResult {
    let mut stdout = io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(0)
}

/// Dials `op` and wires this process's stdio to the connection's slots until
/// the service closes its output.
pub fn handle_dial(
    dialer: &Dialer,
    addr: &str,
    op: &str,
    args: &[String],
    attributes: Attributes,
    timeout: Duration,
) -> HandlerResult {
    let arguments: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut conn = dialer.dial(addr, op, timeout, attributes, &arguments)?;
    conn.await_descriptors(timeout)?;

    // stdin may never reach EOF; this thread is not joined
    if let Some(fd) = conn.take_descriptor(0)? {
        thread::Builder::new()
            .name("russ-stdin".to_string())
            .spawn(move || {
                let mut slot = File::from(fd);
                if let Err(e) = io::copy(&mut io::stdin().lock(), &mut slot) {
                    debug!(error = %e, "Stopped forwarding stdin");
                }
            })?;
    }

    let stderr_pump = match conn.take_descriptor(2)? {
        Some(fd) => Some(
            thread::Builder::new()
                .name("russ-stderr".to_string())
                .spawn(move || io::copy(&mut File::from(fd), &mut io::stderr()))?,
        ),
        None => None,
    };

    if let Some(fd) = conn.take_descriptor(1)? {
        let mut stdout = io::stdout().lock();
        io::copy(&mut File::from(fd), &mut stdout)?;
        stdout.flush()?;
    }

    if let Some(pump) = stderr_pump {
        match pump.join() {
            Ok(copied) => {
                copied?;
            }
            Err(_) => warn!("stderr forwarding thread panicked"),
        }
    }
    conn.release();
    Ok(0)
}

fn current_ids() -> (u32, u32) {
    // SAFETY: getuid/getgid cannot fail.
    unsafe { (libc::getuid(), libc::getgid()) }
}

/// Announces the echo service at `path` and serves it until SIGINT/SIGTERM.
pub fn handle_serve(config: RussConfig, path: &Path, mode: u32) -> HandlerResult {
    let server = Server::new(&config);
    let _signals = SignalHandler::setup(server.shutdown_flag())?;

    let (uid, gid) = current_ids();
    let listener = Listener::announce(path, mode, uid, gid)?.with_config(&config);
    info!(
        path = %path.display(),
        workers = config.workers,
        strict_attributes = config.strict_attributes,
        "Serving echo service"
    );

    let result = server.run(&listener, echo::handle);
    listener.release();
    result?;
    Ok(0)
}
