use crate::status::Status;

pub const MAX_LINE: usize = 1024;

pub const WELCOME_BANNER: &str = r"

              mmm,
             /::* > -Chit Chat!
    \        |::/
     Aaa..../:::\
     \:::::::::::|
      \:::::::::/
       \:::::::/
         \:/\:/
          |_  \__
-------------------------------------
Welcome to the HEveNtful chat server!
-------------------------------------

";

pub const HELP_TEXT: &str = "
usage:
    QUIT         to exit
    LIST         to list users
    DM @nick     to send direct messages to users
    DND          do not disturb
    AWAY         let others know you are away
    ONLINE       let others know when you are back online again
    HELP         show this text
";

/// Everything the server writes to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Banner,
    LoginPrompt,
    PasswordPrompt,
    Rejected,
    Welcome { nick: String },
    Suspended,
    Help,
    Connected { nick: String },
    Quit { nick: String },
    Away { nick: String },
    DoNotDisturb { nick: String },
    Online { nick: String },
    AwayFromKeyboard { nick: String },
    Chat { nick: String, text: String },
    Whisper { from: String, text: String },
    Roster { entries: Vec<(String, Status)> },
}

impl Notice {
    /// The broadcast announcing a presence change.
    pub fn presence(nick: impl Into<String>, status: Status) -> Self {
        let nick = nick.into();
        match status {
            Status::Online => Notice::Online { nick },
            Status::Away => Notice::Away { nick },
            Status::Dnd => Notice::DoNotDisturb { nick },
        }
    }
}

pub fn format_notice(notice: &Notice) -> String {
    match notice {
        Notice::Banner => WELCOME_BANNER.to_string(),
        Notice::LoginPrompt => "login:".to_string(),
        Notice::PasswordPrompt => "password:".to_string(),
        Notice::Rejected => "Sorry, try again!\n".to_string(),
        Notice::Welcome { nick } => format!("\nWelcome {nick}!\nType HELP for help.\n"),
        Notice::Suspended => {
            "\nYou have been suspended because your account is used somewhere else.\n".to_string()
        }
        Notice::Help => format!("\n{HELP_TEXT}"),
        Notice::Connected { nick } => format!("{nick} connected\n"),
        Notice::Quit { nick } => format!("{nick} quit\n"),
        Notice::Away { nick } => format!("{nick} is away\n"),
        Notice::DoNotDisturb { nick } => format!("{nick} wishes not to be disturbed\n"),
        Notice::Online { nick } => format!("{nick} is online\n"),
        Notice::AwayFromKeyboard { nick } => format!("{nick} is away from keyboard\n"),
        Notice::Chat { nick, text } => format!("{nick} -{text}\n"),
        Notice::Whisper { from, text } => format!("<{from} whispers>{text}\n"),
        Notice::Roster { entries } => {
            let count = entries.len();
            let plural = if count == 1 { "" } else { "s" };
            let mut out = format!("{count} user{plural} online\n");
            for (nick, status) in entries {
                out.push_str(nick);
                out.push('\t');
                out.push_str(status.as_str());
                out.push('\n');
            }
            out
        }
    }
}

/// Strips the line terminator and caps the length at [`MAX_LINE`] bytes.
pub fn clean_line(line: &str) -> &str {
    let s = line.trim_end_matches(['\r', '\n']);
    if s.len() <= MAX_LINE {
        return s;
    }
    let mut end = MAX_LINE;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
