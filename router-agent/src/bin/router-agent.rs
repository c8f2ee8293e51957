// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable run for every hook and action delivered to a router unit

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use router_agent::backends::{HookTools, MongoshConnector, SnapRouterService};
use router_agent::deferred::DeferredSignalStore;
use router_agent::{
    Config, Signal, TaskApiError, UpgradeContext, UpgradeReconciler,
    UpgradeTask, UpgradeTaskHandle,
};
use router_agent_types::UnitName;
use slog::{Logger, info, warn};
use slog_error_chain::InlineErrorChain;

#[derive(Debug, Parser)]
#[command(name = "router-agent", about = "Rolling upgrades of the local router")]
struct Args {
    /// Path to the agent's TOML configuration
    #[arg(
        long,
        env = "ROUTER_AGENT_CONFIG",
        default_value = "/etc/router-agent/config.toml"
    )]
    config: Utf8PathBuf,

    /// Name of the unit this agent runs for, e.g. `mongos/2`
    #[arg(long, env = "JUJU_UNIT_NAME")]
    unit: UnitName,

    #[command(subcommand)]
    command: AgentCommand,
}

#[derive(Debug, Subcommand)]
enum AgentCommand {
    /// Handle a lifecycle hook
    Hook {
        /// Hook name, e.g. `upgrade-charm`
        name: String,
    },
    /// Run an operator action
    #[command(subcommand)]
    Action(ActionCommand),
}

#[derive(Debug, Subcommand)]
enum ActionCommand {
    /// Upgrade this unit now, without waiting for its turn
    ForceUpgrade,
    /// Check that the cluster can take an upgrade
    PreUpgradeCheck,
    /// Raise the cluster's feature compatibility version
    SetFeatureCompatibilityVersion {
        /// Version to set, e.g. `7.0`
        version: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    do_run(args).await
}

async fn do_run(args: Args) -> Result<(), anyhow::Error> {
    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config))?;
    let log = config
        .log
        .to_logger("router-agent")
        .context("failed to create logger")?;
    let current_versions = config
        .upgrade
        .current_versions()
        .context("failed to read current versions")?;

    let tools =
        HookTools::new(&log, args.unit.clone(), &config.upgrade.peer_relation);
    let reconciler = UpgradeReconciler::new(
        &log,
        UpgradeContext {
            unit: args.unit.clone(),
            target_revision: config.upgrade.target_revision.clone(),
            current_versions,
        },
        &config.probe,
        tools.clone(),
        SnapRouterService::new(&log, &config.router),
        MongoshConnector::new(&log, &config.router),
        tools.clone(),
    );
    let (task, handle) = UpgradeTask::new(
        &log,
        reconciler,
        config.upgrade.post_upgrade_retry_interval(),
    );
    let task = tokio::spawn(task.run());

    // The command still runs when replay fails, so `force-upgrade` stays
    // available whatever state the signal file is in.
    let store = DeferredSignalStore::new(&log, &config.state_dir);
    if let Err(err) = store.replay(&handle).await {
        warn!(
            log,
            "failed to replay deferred signals";
            "error" => InlineErrorChain::new(&err),
        );
    }

    let result = match args.command {
        AgentCommand::Hook { name } => {
            run_hook(&log, &handle, &config.upgrade.peer_relation, &name).await
        }
        AgentCommand::Action(action) => run_action(&handle, &tools, action).await,
    };

    store
        .shutdown_and_store(&handle)
        .await
        .context("failed to hand off deferred signals")?;
    task.await.context("upgrade task panicked")?;
    result
}

/// The signal a hook delivers, if the upgrade cares about it.
fn signal_for_hook(peer_relation: &str, hook: &str) -> Option<Signal> {
    if let Some(event) = hook
        .strip_prefix(peer_relation)
        .and_then(|rest| rest.strip_prefix("-relation-"))
    {
        return match event {
            "created" => Some(Signal::PeerRelationCreated),
            // A departed unit changes which units are ahead of this one.
            "changed" | "departed" => Some(Signal::PeerRelationChanged),
            _ => None,
        };
    }
    match hook {
        "upgrade-charm" => Some(Signal::CharmUpgraded),
        "update-status" => Some(Signal::UpdateStatus),
        _ => None,
    }
}

async fn run_hook(
    log: &Logger,
    handle: &UpgradeTaskHandle,
    peer_relation: &str,
    hook: &str,
) -> Result<(), anyhow::Error> {
    let Some(signal) = signal_for_hook(peer_relation, hook) else {
        info!(log, "ignoring hook"; "hook" => hook);
        return Ok(());
    };
    handle
        .signal(signal)
        .await
        .with_context(|| format!("failed to handle hook {hook}"))
}

async fn run_action(
    handle: &UpgradeTaskHandle,
    tools: &HookTools,
    action: ActionCommand,
) -> Result<(), anyhow::Error> {
    let outcome = match action {
        ActionCommand::ForceUpgrade => handle.force_upgrade().await,
        ActionCommand::PreUpgradeCheck => handle
            .pre_upgrade_check()
            .await
            .map(|()| "Router is ready for upgrade".to_string()),
        ActionCommand::SetFeatureCompatibilityVersion { version } => handle
            .set_feature_compatibility_version(&version)
            .await
            .map(|()| format!("Feature compatibility version set to {version}")),
    };
    match outcome {
        Ok(message) => tools.action_set("result", &message).await?,
        Err(err @ (TaskApiError::Send | TaskApiError::Recv)) => {
            return Err(err.into());
        }
        Err(TaskApiError::Precheck(failed)) => {
            tools.action_fail(&failed.reason).await?
        }
        Err(err) => {
            tools.action_fail(&InlineErrorChain::new(&err).to_string()).await?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn hooks_map_to_signals() {
        let peer = "upgrade-version-a";
        assert_eq!(
            signal_for_hook(peer, "upgrade-version-a-relation-created"),
            Some(Signal::PeerRelationCreated)
        );
        assert_eq!(
            signal_for_hook(peer, "upgrade-version-a-relation-changed"),
            Some(Signal::PeerRelationChanged)
        );
        assert_eq!(
            signal_for_hook(peer, "upgrade-version-a-relation-departed"),
            Some(Signal::PeerRelationChanged)
        );
        assert_eq!(
            signal_for_hook(peer, "upgrade-charm"),
            Some(Signal::CharmUpgraded)
        );
        assert_eq!(
            signal_for_hook(peer, "update-status"),
            Some(Signal::UpdateStatus)
        );
        assert_eq!(signal_for_hook(peer, "config-changed"), None);
        assert_eq!(signal_for_hook(peer, "cluster-relation-changed"), None);
        assert_eq!(
            signal_for_hook(peer, "upgrade-version-a-relation-broken"),
            None
        );
    }

    #[test]
    fn actions_parse() {
        let args = Args::try_parse_from([
            "router-agent",
            "--config",
            "/tmp/config.toml",
            "--unit",
            "mongos/3",
            "action",
            "set-feature-compatibility-version",
            "7.0",
        ])
        .unwrap();
        assert_eq!(args.unit, UnitName::new("mongos", 3));
        assert!(matches!(
            args.command,
            AgentCommand::Action(ActionCommand::SetFeatureCompatibilityVersion {
                ref version
            }) if version == "7.0"
        ));
    }
}
