#![cfg_attr(test, allow(clippy::expect_used))]

mod auth_view;
mod config;
mod instance_lock;
mod link_context;
mod pending_link;
mod relay;
mod shell_open;
mod surface;
mod user_store;

use anyhow::{Context, Result};
use auth_view::{AuthView, ViewCommand};
use cloak_backend_client::IdentityClient;
use cloak_client_core::adoption::SessionAdoption;
use config::{DesktopConfig, ParsedArgs};
use instance_lock::{InstanceLock, LockOutcome, forward_activation};
use link_context::{Activation, LinkContext};
use shell_open::SystemOpener;
use surface::HeadlessSurface;
use tokio::sync::{mpsc, oneshot};
use user_store::DesktopStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = match config::parse_args(std::env::args_os()) {
        ParsedArgs::Run(args) => args,
        ParsedArgs::Exit(usage) => {
            usage.print().context("print usage")?;
            return Ok(());
        }
    };
    tracing::debug!(links = args.links.len(), "command line parsed");
    let config = DesktopConfig::resolve(&args).context("resolve desktop configuration")?;
    tracing::info!(
        scheme = %config.scheme,
        scheme_source = config.scheme_source,
        instance_addr = %config.instance_addr,
        instance_addr_source = config.instance_addr_source,
        auth_base_url = %config.auth_base_url,
        auth_base_url_source = config.auth_base_url_source,
        api_base_url = %config.api_base_url,
        api_base_url_source = config.api_base_url_source,
        "desktop configuration resolved"
    );

    let argv = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    let lock = match InstanceLock::acquire(config.instance_addr, &config.instance_key_path)
        .await
        .context("acquire instance lock")?
    {
        LockOutcome::Primary(lock) => lock,
        LockOutcome::AlreadyRunning => {
            forward_activation(
                config.instance_addr,
                &config.instance_key_path,
                &argv,
                config.forward_timeout,
            )
            .await
            .context("hand activation to running instance")?;
            tracing::info!("activation handed to running instance");
            return Ok(());
        }
    };

    let store = match &config.store_path {
        Some(path) => DesktopStore::load(path.clone()),
        None => DesktopStore::load_default(),
    };
    tracing::info!(path = %store.path().display(), "local store opened");
    let backend =
        IdentityClient::new(config.identity_client()).context("build identity client")?;
    let adoption = SessionAdoption::new(backend, store.clone())
        .with_exchange_timeout(config.exchange_timeout);
    let view = AuthView::new(adoption, SystemOpener, config.telegram_bot.clone());

    let (relay_sender, endpoint, signals) = relay::relay_channel(config.ack_timeout);
    let context = LinkContext::new(
        config.link_context(),
        relay_sender,
        HeadlessSurface::default(),
    );

    let (activation_tx, activation_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    activation_tx
        .send(Activation::Launch { argv })
        .context("queue launch activation")?;
    if config.sign_out {
        command_tx
            .send(ViewCommand::Logout)
            .context("queue sign out")?;
    }
    if config.telegram_login {
        command_tx
            .send(ViewCommand::BeginTelegramLogin)
            .context("queue telegram login")?;
    }

    let lock_task = tokio::spawn(lock.serve(activation_tx.clone()));
    let coordinator = tokio::spawn(context.run(activation_rx, signals, shutdown_rx));
    let view_task = tokio::spawn(view.run(endpoint, command_rx));

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    tracing::info!("shutting down");

    let _ = shutdown_tx.send(());
    let context = coordinator.await.context("join link coordinator")?;
    tracing::debug!(
        listener = context.listener_state().as_str(),
        "link coordinator stopped"
    );
    if let Some(pending) = context.take_pending() {
        match store.persist_pending_auth(&pending.raw_data) {
            Ok(()) => tracing::info!("saved undelivered deep link for next start"),
            Err(error) => tracing::warn!(error = %error, "failed to save undelivered deep link"),
        }
    }
    drop(context);
    drop(command_tx);

    let view = view_task.await.context("join auth view")?;
    tracing::info!(
        route = view.route().as_str(),
        auth_state = view.auth_state().as_str(),
        status_kind = view.status().map(|status| status.kind.as_str()),
        status = view.status().map(|status| status.text.as_str()),
        "auth view stopped"
    );
    lock_task.abort();
    Ok(())
}
