//! The `prefork run` subcommand: spawn demo workers from an application root.
//!
//! The boot procedure here is a stand-in (an optional sleep, standing in
//! for framework boot time); the endpoint answers each connection with a
//! one-line banner. Real embedders supply both in code.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use prefork::{
    BasicEndpointFactory, BootError, Spawner, SpawnerOptions, Worker, spawn_cold,
};

/// Arguments for the `prefork run` subcommand.
#[derive(clap::Args)]
pub struct RunArgs {
    /// Application root directory.
    root: String,

    /// Environment name exported to the boot procedure.
    #[arg(long, default_value = "production")]
    env: String,

    /// Number of workers to spawn.
    #[arg(long, short = 'n', default_value_t = 1)]
    workers: u32,

    /// Boot from scratch per worker instead of preloading once.
    #[arg(long)]
    cold: bool,

    /// Attempt privilege de-escalation before boot.
    #[arg(long)]
    lower_privilege: bool,

    /// Fallback unprivileged username for de-escalation.
    #[arg(long, default_value = "nobody")]
    fallback_user: String,

    /// Entry file checked inside the root.
    #[arg(long, default_value = prefork::DEFAULT_ENTRY_FILE)]
    entry_file: String,

    /// Milliseconds the stand-in boot procedure sleeps.
    #[arg(long, default_value_t = 0)]
    boot_delay_ms: u64,

    /// Print worker identities as JSON.
    #[arg(long)]
    json: bool,
}

/// Validates an application root and reports the result.
pub fn check(root: &str, entry_file: &str) -> Result<()> {
    SpawnerOptions::new(root)
        .entry_file(entry_file)
        .validate()
        .context("application root validation failed")?;
    println!("ok: {root}");
    Ok(())
}

fn banner_handler(mut stream: UnixStream) {
    let _ = writeln!(stream, "prefork worker {}", std::process::id());
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let options = SpawnerOptions::new(&self.root)
            .environment(&self.env)
            .lower_privilege(self.lower_privilege)
            .fallback_user(&self.fallback_user)
            .entry_file(&self.entry_file);

        let delay = Duration::from_millis(self.boot_delay_ms);
        let boot = move || -> Result<(), BootError> {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            Ok(())
        };
        let endpoints = BasicEndpointFactory::new(banner_handler);

        let workers = if self.cold {
            let mut workers = Vec::new();
            for _ in 0..self.workers {
                workers.push(spawn_cold(options.clone(), boot, endpoints)?);
            }
            workers
        } else {
            let mut spawner = Spawner::start(options, boot, endpoints)?;
            let workers = (0..self.workers)
                .map(|_| spawner.spawn())
                .collect::<prefork::Result<Vec<_>>>()?;
            // Workers outlive the preloader; stopping it here keeps the
            // process table tidy while they serve.
            spawner.stop()?;
            workers
        };

        for worker in &workers {
            self.print_identity(worker)?;
        }

        // Hold the owner pipes until every worker exits; closing them
        // (by exiting) is what tells the workers to shut down.
        for worker in &workers {
            worker.wait_until_exit()?;
        }
        Ok(())
    }

    fn print_identity(&self, worker: &Worker) -> Result<()> {
        if self.json {
            let obj = serde_json::json!({
                "pid": worker.pid(),
                "endpoint": worker.endpoint_name(),
                "abstract_namespace": worker.uses_abstract_namespace(),
            });
            println!("{}", serde_json::to_string(&obj)?);
        } else {
            println!(
                "worker {} listening on {}{}",
                worker.pid(),
                worker.endpoint_name(),
                if worker.uses_abstract_namespace() {
                    " (abstract)"
                } else {
                    ""
                }
            );
        }
        Ok(())
    }
}
