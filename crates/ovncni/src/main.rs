//! ovn-cni entry point.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use color_eyre::eyre::Result;
use ovncni::{
    CniArgs, CniCommand, ErrorEnvelope, KubeApiMetadata, MetadataSource, Services, StaticMetadata,
    Store, VersionResult, broker_for, execute,
};
use ovncni_common::{CniError, CniResult, NetConf};
use ovncni_network::NetlinkFabricator;
use ovncni_ovsdb::schema::{OPEN_VSWITCH_DB, OVN_NORTHBOUND_DB};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize error handling
    color_eyre::install()?;

    let args = CniArgs::parse();
    if args.command == CniCommand::Version {
        print_json(&VersionResult::default())?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut stdin = Vec::new();
    std::io::stdin().read_to_end(&mut stdin)?;
    let conf = match NetConf::from_slice(&stdin) {
        Ok(conf) => conf,
        Err(e) => {
            print_json(&ErrorEnvelope::from_error("1.0.0", &e))?;
            return Ok(ExitCode::FAILURE);
        }
    };

    init_tracing(&conf)?;
    tracing::info!(command = ?args.command, container = %args.container_id, ifname = %args.ifname, "Invoked");

    let outcome = match run(&args, &conf).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "Setup failed");
            Err(ErrorEnvelope::from_error(&conf.cni_version, &e))
        }
    };

    match outcome {
        Ok(Some(document)) => {
            print_json(&document)?;
            Ok(ExitCode::SUCCESS)
        }
        Ok(None) => Ok(ExitCode::SUCCESS),
        Err(envelope) => {
            tracing::error!(code = envelope.code, msg = %envelope.msg, "Command failed");
            print_json(&envelope)?;
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Build the clients, run the command, tear the clients down.
///
/// Only ADD refuses to start without every database; DEL and CHECK run
/// against whatever is reachable.
async fn run(
    args: &CniArgs,
    conf: &NetConf,
) -> CniResult<Result<Option<serde_json::Value>, ErrorEnvelope>> {
    let timeout = conf.timeouts.database();
    let broker = broker_for(args.command, conf)?;
    let links = NetlinkFabricator::new();
    let metadata: Box<dyn MetadataSource> = if conf.kubernetes.api_server.is_some() {
        Box::new(KubeApiMetadata::from_config(&conf.kubernetes, timeout)?)
    } else {
        tracing::debug!("No API server configured, workload names are pod names");
        Box::new(StaticMetadata::new())
    };

    let switch_db = Store::connect(args.command, &conf.ovs_db, OPEN_VSWITCH_DB, timeout).await?;
    let northbound_db =
        match Store::connect(args.command, &conf.ovn_nb, OVN_NORTHBOUND_DB, timeout).await {
            Ok(store) => store,
            Err(e) => {
                switch_db.close().await;
                return Err(e);
            }
        };

    let services = Services {
        broker: broker.as_ref(),
        links: &links,
        switch_db: switch_db.client(),
        northbound_db: northbound_db.client(),
        metadata: metadata.as_ref(),
    };
    let outcome = execute(args, conf, &services).await;

    northbound_db.close().await;
    switch_db.close().await;
    Ok(outcome)
}

/// Log to the configured file; stdout belongs to the result document.
fn init_tracing(conf: &NetConf) -> CniResult<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(parse_directive("ovn_cni=info")?)
        .add_directive(parse_directive("ovncni=info")?);

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&conf.log_file);
    match file {
        Ok(file) => tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_ansi(false).with_writer(Mutex::new(file)))
            .with(filter)
            .init(),
        Err(e) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .with(filter)
                .init();
            tracing::warn!(path = %conf.log_file.display(), error = %e, "Cannot open log file, logging to stderr");
        }
    }
    Ok(())
}

fn parse_directive(directive: &str) -> CniResult<tracing_subscriber::filter::Directive> {
    directive.parse().map_err(|e| CniError::Config {
        message: format!("invalid log directive {directive}: {e}"),
    })
}

fn print_json<T: serde::Serialize>(document: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, document)?;
    writeln!(stdout)?;
    Ok(())
}
