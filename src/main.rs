use anyhow::Context;
use feedwire::{
    api::AccountCredentials,
    config::Config,
    events::{EventKind, ServerEvent},
    session::SessionEvent,
    FeedClient,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let client = FeedClient::initialize(config.clone())?;

    if !client.credentials.is_authenticated() {
        let (Some(username), Some(password)) = (config.username, config.password) else {
            anyhow::bail!("no stored credential; set FEED_USERNAME and FEED_PASSWORD to log in");
        };
        client
            .api
            .login(&AccountCredentials::new(username, password))
            .await
            .context("login failed")?;
    }

    let me = client.api.me().await.context("failed to load current user")?;
    info!(user = %me.username, "session ready");

    let posts = client.api.posts().await.context("failed to load feed")?;
    for post in &posts {
        info!(
            id = %post.id,
            author = %post.author.username,
            upvotes = post.upvotes,
            downvotes = post.downvotes,
            "{}",
            post.content
        );
    }

    let channel = client.realtime()?;
    channel.subscribe(EventKind::MessageReceived, |event| {
        if let ServerEvent::MessageReceived(message) = event {
            info!(from = %message.from.username, "{}", message.content);
        }
    });
    channel.subscribe(EventKind::ConnectionRequest, |event| {
        if let ServerEvent::ConnectionRequest(request) = event {
            info!(from = ?request.from_username, "connection request");
        }
    });
    channel.subscribe(EventKind::Error, |event| {
        if let ServerEvent::Error(notice) = event {
            warn!(message = %notice.message, "server error event");
        }
    });

    let mut session_events = client.session.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        event = session_events.recv() => match event {
            Ok(SessionEvent::Expired { reason }) => error!(%reason, "session expired, log in again"),
            Err(e) => warn!(error = %e, "session signal closed"),
        },
    }

    channel.shutdown().await;
    Ok(())
}
