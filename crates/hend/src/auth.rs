use crate::connection::{Connection, Inbound};
use crate::directory::Client;
use crate::session::Hub;
use hen_core::Notice;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum AuthOutcome {
    Accepted(Arc<Client>),
    Rejected,
    Disconnected,
}

/// Runs the login/password exchange. On success the client is registered,
/// welcomed and announced; any earlier session with the same nick is evicted
/// before the new one becomes visible.
pub async fn authenticate<R>(hub: &Hub, conn: &mut Connection<R>) -> AuthOutcome
where
    R: AsyncRead + Unpin,
{
    let Some(nick) = prompt(conn, &Notice::LoginPrompt).await else {
        return AuthOutcome::Disconnected;
    };
    let Some(password) = prompt(conn, &Notice::PasswordPrompt).await else {
        return AuthOutcome::Disconnected;
    };

    let verified = match hub.credentials.verify(&nick, &password).await {
        Ok(ok) => ok,
        Err(err) => {
            warn!(%err, nick = %nick, "credential lookup failed");
            false
        }
    };
    if !verified {
        warn!(addr = %conn.address, nick = %nick, "login rejected");
        let _ = conn.send(&Notice::Rejected).await;
        return AuthOutcome::Rejected;
    }

    if let Some(prior) = hub.directory.find_by_nick(&nick).await {
        suspend(hub, &prior).await;
        hub.directory.unregister(&prior.address).await;
    }

    let client = Arc::new(Client::new(conn.address, nick.clone(), conn.outbound()));
    if let Some(raced) = hub.directory.register(client.clone()).await {
        suspend(hub, &raced).await;
    }
    info!(addr = %conn.address, nick = %nick, "client logged in");

    let welcome = Notice::Welcome { nick: nick.clone() };
    if let Err(err) = hub.broadcaster.unicast(&client, &welcome).await {
        debug!(%err, "welcome not delivered");
    }
    hub.broadcaster
        .multicast(&Notice::Connected { nick }, &[client.address])
        .await;
    AuthOutcome::Accepted(client)
}

/// Sends a prompt and reads the trimmed answer; `None` once the peer is gone.
async fn prompt<R>(conn: &mut Connection<R>, notice: &Notice) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    conn.send(notice).await.ok()?;
    match conn.next_line(None).await {
        Inbound::Line(line) => Some(line.trim().to_string()),
        Inbound::Closed | Inbound::Idle => None,
    }
}

async fn suspend(hub: &Hub, prior: &Client) {
    info!(addr = %prior.address, nick = %prior.nick, "evicting session, nick logged in elsewhere");
    if let Err(err) = hub.broadcaster.unicast(prior, &Notice::Suspended).await {
        warn!(%err, "could not notify evicted session");
    }
    prior.evict();
}
