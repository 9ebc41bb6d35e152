use crate::auth::{authenticate, AuthOutcome};
use crate::broadcast::Broadcaster;
use crate::connection::{close_writer, Connection, Inbound};
use crate::directory::{Client, ClientDirectory};
use hen_core::{classify, parse_direct_message, Command, CredentialStore, Notice, Status};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub queue_depth: usize,
    pub send_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            send_timeout: Duration::from_secs(5),
            idle_timeout: None,
        }
    }
}

/// State shared by every session task.
pub struct Hub {
    pub directory: Arc<ClientDirectory>,
    pub broadcaster: Broadcaster,
    pub credentials: Arc<dyn CredentialStore>,
    pub settings: SessionSettings,
}

impl Hub {
    pub fn new(credentials: Arc<dyn CredentialStore>, settings: SessionSettings) -> Self {
        let directory = Arc::new(ClientDirectory::new());
        let broadcaster = Broadcaster::new(directory.clone(), settings.send_timeout);
        Self {
            directory,
            broadcaster,
            credentials,
            settings,
        }
    }

    pub async fn is_logged_in(&self, address: &SocketAddr) -> bool {
        self.directory.contains(address).await
    }
}

/// `New -> Authenticating -> Active -> Terminated`; authentication failure
/// goes straight to `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Authenticating,
    Active,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Quit,
    Closed,
    Idle,
    WriteFailed,
    Evicted,
}

struct Session<R> {
    hub: Arc<Hub>,
    conn: Connection<R>,
    state: SessionState,
}

/// Drives one accepted connection until it terminates.
pub async fn run_session<R, W>(hub: Arc<Hub>, reader: R, writer: W, address: SocketAddr)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    info!(addr = %address, "new connection");
    let (conn, writer_task) = Connection::open(reader, writer, address, hub.settings.queue_depth);
    let mut session = Session {
        hub,
        conn,
        state: SessionState::New,
    };
    session.run().await;
    drop(session);
    close_writer(writer_task).await;
    debug!(addr = %address, "connection closed");
}

impl<R: AsyncRead + Unpin> Session<R> {
    fn transition(&mut self, next: SessionState) {
        debug!(addr = %self.conn.address, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    async fn run(&mut self) {
        self.transition(SessionState::Authenticating);
        if self.conn.send(&Notice::Banner).await.is_err() {
            self.transition(SessionState::Terminated);
            return;
        }
        let client = match authenticate(&self.hub, &mut self.conn).await {
            AuthOutcome::Accepted(client) => client,
            AuthOutcome::Rejected | AuthOutcome::Disconnected => {
                self.transition(SessionState::Terminated);
                return;
            }
        };

        self.transition(SessionState::Active);
        let ending = self.serve(&client).await;
        self.terminate(&client, ending).await;
    }

    async fn serve(&mut self, client: &Arc<Client>) -> Ending {
        let idle = self.hub.settings.idle_timeout;
        loop {
            let inbound = tokio::select! {
                _ = client.evicted() => return Ending::Evicted,
                inbound = self.conn.next_line(idle) => inbound,
            };
            let line = match inbound {
                Inbound::Line(line) => line,
                Inbound::Closed => return Ending::Closed,
                Inbound::Idle => return Ending::Idle,
            };

            // Lines are only served while this address is still registered.
            if !self.hub.is_logged_in(&client.address).await {
                return Ending::Evicted;
            }

            let command = classify(&line);
            debug!(nick = %client.nick, ?command, "command");
            if command == Command::Quit {
                return Ending::Quit;
            }
            if let Err(err) = dispatch(&self.hub, client, command).await {
                warn!(nick = %client.nick, %err, "reply failed");
                return Ending::WriteFailed;
            }
        }
    }

    async fn terminate(&mut self, client: &Client, ending: Ending) {
        if ending == Ending::Evicted || client.is_evicted() {
            info!(addr = %client.address, nick = %client.nick, "evicted session closed");
        } else {
            info!(addr = %client.address, nick = %client.nick, ?ending, "client quit");
            self.hub
                .broadcaster
                .multicast(
                    &Notice::Quit {
                        nick: client.nick.clone(),
                    },
                    &[client.address],
                )
                .await;
        }
        self.hub.directory.unregister(&client.address).await;
        let online = self.hub.directory.len().await;
        debug!(online, "client removed");
        self.transition(SessionState::Terminated);
    }
}

/// Executes one non-quit command on behalf of `client`. Errors mean a reply
/// to `client` itself could not be written.
pub async fn dispatch(hub: &Hub, client: &Arc<Client>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Quit => {}
        Command::List => {
            let entries = hub
                .directory
                .snapshot()
                .await
                .iter()
                .map(|member| (member.nick.clone(), member.status()))
                .collect();
            hub.broadcaster
                .unicast(client, &Notice::Roster { entries })
                .await?;
        }
        Command::Help => hub.broadcaster.unicast(client, &Notice::Help).await?,
        Command::SetStatus(status) => {
            client.set_status(status);
            info!(nick = %client.nick, %status, "status changed");
            hub.broadcaster
                .multicast(&Notice::presence(client.nick.clone(), status), &[])
                .await;
        }
        Command::DirectMessage(line) => direct_message(hub, client, &line).await?,
        Command::Chat(text) => {
            let notice = Notice::Chat {
                nick: client.nick.clone(),
                text,
            };
            hub.broadcaster.multicast(&notice, &[client.address]).await;
        }
    }
    Ok(())
}

async fn direct_message(hub: &Hub, sender: &Arc<Client>, line: &str) -> anyhow::Result<()> {
    let Some(dm) = parse_direct_message(line) else {
        debug!(nick = %sender.nick, "malformed direct message dropped");
        return Ok(());
    };
    if dm.text.is_empty() {
        debug!(nick = %sender.nick, "empty direct message dropped");
        return Ok(());
    }

    let whisper = Notice::Whisper {
        from: sender.nick.clone(),
        text: dm.text.clone(),
    };
    let recipients = hub.directory.snapshot().await;
    for recipient in recipients.iter().filter(|c| dm.is_addressed_to(&c.nick)) {
        match recipient.status() {
            Status::Dnd => {
                let nick = recipient.nick.clone();
                hub.broadcaster
                    .unicast(sender, &Notice::DoNotDisturb { nick })
                    .await?;
                continue;
            }
            Status::Away => {
                let nick = recipient.nick.clone();
                hub.broadcaster
                    .unicast(sender, &Notice::AwayFromKeyboard { nick })
                    .await?;
            }
            Status::Online => {}
        }
        if let Err(err) = hub.broadcaster.unicast(recipient, &whisper).await {
            debug!(to = %recipient.nick, %err, "direct message not delivered");
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::directory::tests::{addr, client};
    use hen_core::{format_notice, StaticCredentials};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    pub(crate) fn test_hub() -> Hub {
        test_hub_with(SessionSettings {
            queue_depth: 16,
            send_timeout: Duration::from_secs(1),
            idle_timeout: None,
        })
    }

    fn test_hub_with(settings: SessionSettings) -> Hub {
        let credentials = StaticCredentials::new([
            ("adam", "adampw"),
            ("ben", "benpw"),
            ("clemens", "clemenspw"),
        ]);
        Hub::new(Arc::new(credentials), settings)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line);
        }
        out
    }

    struct Peer {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        buf: String,
        task: JoinHandle<()>,
    }

    impl Peer {
        fn connect(hub: &Arc<Hub>, port: u16) -> Self {
            let (local, remote) = tokio::io::duplex(16 * 1024);
            let (server_r, server_w) = tokio::io::split(remote);
            let task = tokio::spawn(run_session(hub.clone(), server_r, server_w, addr(port)));
            let (reader, writer) = tokio::io::split(local);
            Self {
                reader,
                writer,
                buf: String::new(),
                task,
            }
        }

        async fn send(&mut self, line: &str) {
            self.send_raw(format!("{line}\n").as_bytes()).await;
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        /// Reads until `needle` shows up and consumes output through it.
        async fn expect(&mut self, needle: &str) -> String {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                if let Some(pos) = self.buf.find(needle) {
                    let end = pos + needle.len();
                    return self.buf.drain(..end).collect();
                }
                let mut chunk = [0u8; 1024];
                let n = tokio::time::timeout_at(deadline, self.reader.read(&mut chunk))
                    .await
                    .unwrap_or_else(|_| {
                        panic!("timed out waiting for {needle:?}, have {:?}", self.buf)
                    })
                    .unwrap();
                assert!(n > 0, "closed while waiting for {needle:?}, have {:?}", self.buf);
                self.buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
            }
        }

        /// Everything that arrives within `ms`, plus anything still buffered.
        async fn quiet(&mut self, ms: u64) -> String {
            let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
            let mut chunk = [0u8; 1024];
            while let Ok(Ok(n)) =
                tokio::time::timeout_at(deadline, self.reader.read(&mut chunk)).await
            {
                if n == 0 {
                    break;
                }
                self.buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
            }
            std::mem::take(&mut self.buf)
        }

        async fn login(&mut self, nick: &str, password: &str) {
            self.expect("login:").await;
            self.send(nick).await;
            self.expect("password:").await;
            self.send(password).await;
            self.expect(&format!("Welcome {nick}!\nType HELP for help.\n")).await;
        }

        async fn finished(self) {
            tokio::time::timeout(Duration::from_secs(3), self.task)
                .await
                .expect("session did not terminate")
                .unwrap();
        }
    }

    async fn three_peers(hub: &Arc<Hub>) -> (Peer, Peer, Peer) {
        let mut adam = Peer::connect(hub, 50000);
        adam.login("adam", "adampw").await;
        let mut ben = Peer::connect(hub, 50001);
        ben.login("ben", "benpw").await;
        adam.expect("ben connected\n").await;
        let mut clemens = Peer::connect(hub, 50002);
        clemens.login("clemens", "clemenspw").await;
        adam.expect("clemens connected\n").await;
        ben.expect("clemens connected\n").await;
        (adam, ben, clemens)
    }

    #[test]
    fn session_future_can_be_spawned() {
        fn assert_send<T: Send + 'static>(_: &T) {}
        let hub = Arc::new(test_hub());
        let (_local, remote) = tokio::io::duplex(64);
        let (server_r, server_w) = tokio::io::split(remote);
        let session = run_session(hub, server_r, server_w, addr(50099));
        assert_send(&session);
    }

    #[tokio::test]
    async fn banner_precedes_login_prompt() {
        let hub = Arc::new(test_hub());
        let mut peer = Peer::connect(&hub, 50000);
        let greeting = peer.expect("login:").await;
        assert!(greeting.contains("Welcome to the HEveNtful chat server!"));
    }

    #[tokio::test]
    async fn chat_reaches_everyone_but_the_sender() {
        let hub = Arc::new(test_hub());
        let (mut adam, mut ben, mut clemens) = three_peers(&hub).await;

        adam.send("Hi guys!").await;
        ben.expect("adam -Hi guys!\n").await;
        clemens.expect("adam -Hi guys!\n").await;

        assert!(!ben.quiet(100).await.contains("Hi guys!"));
        assert!(!clemens.quiet(100).await.contains("Hi guys!"));
        assert!(!adam.quiet(100).await.contains("Hi guys!"));
    }

    #[tokio::test]
    async fn direct_message_reaches_only_the_recipient() {
        let hub = Arc::new(test_hub());
        let (mut adam, mut ben, mut clemens) = three_peers(&hub).await;

        adam.send("DM @clemens Hello Clemens").await;
        let got = clemens.expect("<adam whispers>Hello Clemens\n").await;
        assert!(got.contains("adam"));
        assert!(!clemens.quiet(100).await.contains("Hello Clemens"));
        assert!(!ben.quiet(100).await.contains("Hello Clemens"));
        assert!(!adam.quiet(50).await.contains("Hello Clemens"));
    }

    #[tokio::test]
    async fn presence_changes_and_roster() {
        let hub = Arc::new(test_hub());
        let (mut adam, mut ben, mut clemens) = three_peers(&hub).await;

        ben.send("AWAY").await;
        for peer in [&mut adam, &mut ben, &mut clemens] {
            peer.expect("ben is away\n").await;
        }
        clemens.send("DND").await;
        for peer in [&mut adam, &mut ben, &mut clemens] {
            peer.expect("clemens wishes not to be disturbed\n").await;
        }

        adam.send("LIST").await;
        adam.expect("3 users online\nadam\tONLINE\nben\tAWAY\nclemens\tDND\n")
            .await;

        adam.send("DM @clemens psst").await;
        adam.expect("clemens wishes not to be disturbed\n").await;
        adam.send("DM @ben hey").await;
        adam.expect("ben is away from keyboard\n").await;
        ben.expect("<adam whispers>hey\n").await;
        assert!(!clemens.quiet(100).await.contains("psst"));
    }

    #[tokio::test]
    async fn non_utf8_input_is_chat_not_a_disconnect() {
        let hub = Arc::new(test_hub());
        let (mut adam, mut ben, _clemens) = three_peers(&hub).await;

        adam.send_raw(b"caf\xe9 ole\n").await;
        ben.expect("adam -caf\u{fffd} ole\n").await;
        assert!(!ben.quiet(100).await.contains("adam quit"));
        assert!(hub.is_logged_in(&addr(50000)).await);
    }

    #[tokio::test]
    async fn session_dropped_from_directory_stops_serving() {
        let hub = Arc::new(test_hub());
        let (mut adam, mut ben, _clemens) = three_peers(&hub).await;

        hub.directory.unregister(&addr(50001)).await;
        ben.send("anyone there?").await;
        ben.finished().await;
        let seen = adam.quiet(100).await;
        assert!(!seen.contains("anyone there?"));
        assert!(!seen.contains("ben quit"));
    }

    #[tokio::test]
    async fn help_goes_to_requester_only() {
        let hub = Arc::new(test_hub());
        let (mut adam, mut ben, _clemens) = three_peers(&hub).await;
        adam.send("HELP").await;
        adam.expect("usage:").await;
        assert!(!ben.quiet(100).await.contains("usage:"));
    }

    #[tokio::test]
    async fn quit_is_announced_and_cleans_up() {
        let hub = Arc::new(test_hub());
        let (mut adam, mut ben, mut clemens) = three_peers(&hub).await;

        ben.send("QUIT").await;
        adam.expect("ben quit\n").await;
        clemens.expect("ben quit\n").await;
        assert!(!ben.quiet(100).await.contains("ben quit"));
        ben.finished().await;
        assert!(!hub.is_logged_in(&addr(50001)).await);
        assert!(hub.directory.find_by_nick("ben").await.is_none());
    }

    #[tokio::test]
    async fn blank_line_quits() {
        let hub = Arc::new(test_hub());
        let (mut adam, mut ben, _clemens) = three_peers(&hub).await;
        ben.send("   ").await;
        adam.expect("ben quit\n").await;
        ben.finished().await;
    }

    #[tokio::test]
    async fn dropped_connection_counts_as_quit() {
        let hub = Arc::new(test_hub());
        let (mut adam, ben, _clemens) = three_peers(&hub).await;
        let Peer {
            reader,
            writer,
            task,
            ..
        } = ben;
        drop(reader);
        drop(writer);
        adam.expect("ben quit\n").await;
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!hub.is_logged_in(&addr(50001)).await);
    }

    #[tokio::test]
    async fn wrong_password_closes_connection() {
        let hub = Arc::new(test_hub());
        let mut peer = Peer::connect(&hub, 50005);
        peer.expect("login:").await;
        peer.send("adam").await;
        peer.expect("password:").await;
        peer.send("wrong").await;
        peer.expect("Sorry, try again!").await;
        peer.finished().await;
        assert!(!hub.is_logged_in(&addr(50005)).await);
    }

    #[tokio::test]
    async fn second_login_evicts_first_session() {
        let hub = Arc::new(test_hub());
        let mut first = Peer::connect(&hub, 50010);
        first.login("adam", "adampw").await;
        let mut ben = Peer::connect(&hub, 50011);
        ben.login("ben", "benpw").await;
        first.expect("ben connected\n").await;

        let mut second = Peer::connect(&hub, 50012);
        second.login("adam", "adampw").await;

        let suspended = format_notice(&Notice::Suspended);
        first.expect(&suspended).await;
        let rest = first.quiet(100).await;
        assert!(!rest.contains("suspended"));
        first.finished().await;

        ben.expect("adam connected\n").await;
        assert!(!ben.quiet(100).await.contains("adam quit"));
        assert!(!hub.is_logged_in(&addr(50010)).await);
        let holder = hub.directory.find_by_nick("adam").await.unwrap();
        assert_eq!(holder.address, addr(50012));
    }

    #[tokio::test]
    async fn idle_sessions_are_closed() {
        let hub = Arc::new(test_hub_with(SessionSettings {
            queue_depth: 16,
            send_timeout: Duration::from_secs(1),
            idle_timeout: Some(Duration::from_millis(300)),
        }));
        let mut adam = Peer::connect(&hub, 50020);
        adam.login("adam", "adampw").await;
        let mut ben = Peer::connect(&hub, 50021);
        ben.login("ben", "benpw").await;
        ben.expect("adam quit\n").await;
        adam.finished().await;
        assert!(!hub.is_logged_in(&addr(50020)).await);
    }

    #[tokio::test]
    async fn dnd_recipient_is_not_disturbed() {
        let hub = test_hub();
        let (adam, mut adam_rx) = client(51000, "adam");
        let (clemens, mut clemens_rx) = client(51001, "clemens");
        hub.directory.register(adam.clone()).await;
        hub.directory.register(clemens.clone()).await;
        clemens.set_status(Status::Dnd);

        dispatch(&hub, &adam, classify("DM @clemens Hello Clemens"))
            .await
            .unwrap();
        assert_eq!(
            drain(&mut adam_rx),
            vec!["clemens wishes not to be disturbed\n".to_string()]
        );
        assert!(drain(&mut clemens_rx).is_empty());
    }

    #[tokio::test]
    async fn away_recipient_gets_message_and_sender_is_told() {
        let hub = test_hub();
        let (adam, mut adam_rx) = client(51000, "adam");
        let (ben, mut ben_rx) = client(51001, "ben");
        hub.directory.register(adam.clone()).await;
        hub.directory.register(ben.clone()).await;
        ben.set_status(Status::Away);

        dispatch(&hub, &adam, classify("DM @ben lunch?")).await.unwrap();
        assert_eq!(
            drain(&mut adam_rx),
            vec!["ben is away from keyboard\n".to_string()]
        );
        assert_eq!(drain(&mut ben_rx), vec!["<adam whispers>lunch?\n".to_string()]);
    }

    #[tokio::test]
    async fn multi_recipient_dm_skips_unknown_nicks() {
        let hub = test_hub();
        let (adam, mut adam_rx) = client(51000, "adam");
        let (ben, mut ben_rx) = client(51001, "ben");
        let (clemens, mut clemens_rx) = client(51002, "clemens");
        for c in [&adam, &ben, &clemens] {
            hub.directory.register(c.clone()).await;
        }

        dispatch(&hub, &adam, classify("DM @ben @ghost @clemens @ben meeting"))
            .await
            .unwrap();
        assert!(drain(&mut adam_rx).is_empty());
        assert_eq!(drain(&mut ben_rx), vec!["<adam whispers>meeting\n".to_string()]);
        assert_eq!(
            drain(&mut clemens_rx),
            vec!["<adam whispers>meeting\n".to_string()]
        );
    }

    #[tokio::test]
    async fn malformed_or_empty_dm_is_dropped() {
        let hub = test_hub();
        let (adam, mut adam_rx) = client(51000, "adam");
        let (ben, mut ben_rx) = client(51001, "ben");
        hub.directory.register(adam.clone()).await;
        hub.directory.register(ben.clone()).await;

        for line in ["DM ben hi", "DM @ hi", "DM @ben"] {
            dispatch(&hub, &adam, classify(line)).await.unwrap();
        }
        assert!(drain(&mut adam_rx).is_empty());
        assert!(drain(&mut ben_rx).is_empty());
    }

    #[tokio::test]
    async fn roster_matches_every_status_combination() {
        for statuses in [
            [Status::Online, Status::Online, Status::Online],
            [Status::Away, Status::Dnd, Status::Online],
            [Status::Dnd, Status::Dnd, Status::Away],
        ] {
            let hub = test_hub();
            let mut members = Vec::new();
            for (i, status) in statuses.iter().enumerate() {
                let (c, rx) = client(52000 + i as u16, &format!("user{i}"));
                c.set_status(*status);
                hub.directory.register(c.clone()).await;
                members.push((c, rx));
            }
            let requester = members[0].0.clone();
            dispatch(&hub, &requester, Command::List).await.unwrap();

            let roster = drain(&mut members[0].1).concat();
            let mut lines = roster.lines();
            assert_eq!(lines.next(), Some("3 users online"));
            let listed: Vec<&str> = lines.collect();
            assert_eq!(listed.len(), 3);
            for (i, status) in statuses.iter().enumerate() {
                assert_eq!(listed[i], format!("user{i}\t{status}"));
            }
            assert!(drain(&mut members[1].1).is_empty());
        }
    }

    #[tokio::test]
    async fn status_change_is_announced_to_everyone_including_self() {
        let hub = test_hub();
        let (adam, mut adam_rx) = client(51000, "adam");
        let (ben, mut ben_rx) = client(51001, "ben");
        hub.directory.register(adam.clone()).await;
        hub.directory.register(ben.clone()).await;

        dispatch(&hub, &adam, Command::SetStatus(Status::Away))
            .await
            .unwrap();
        assert_eq!(adam.status(), Status::Away);
        assert_eq!(drain(&mut adam_rx), vec!["adam is away\n".to_string()]);
        assert_eq!(drain(&mut ben_rx), vec!["adam is away\n".to_string()]);
    }
}
