use clap::Parser;
use callgate::cli::Cli;
use callgate::gateway::Gateway;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(cli.log_level.parse()?),
        )
        .init();

    if cli.self_test {
        return run_self_test(&cli);
    }

    let gateway = Gateway::new(&cli)?;

    let shutdown = gateway.shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("shutdown signal received");
        shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    })?;

    tracing::info!(at_port = %cli.at_port, pcm_port = %cli.pcm_port, "starting callgate");
    gateway.run()?;
    Ok(())
}

/// Opens the AT port, runs the modem init sequence, and exits. Used to
/// confirm wiring (device paths, baud, PCM frame rate) without answering
/// a call.
fn run_self_test(cli: &Cli) -> anyhow::Result<()> {
    let gateway = Gateway::new(cli)?;
    {
        let at = gateway.at_session.lock().unwrap();
        tracing::info!(device = at.device(), "modem initialized");
        at.shutdown();
    }
    Ok(())
}
