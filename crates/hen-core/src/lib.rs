pub mod command;
pub mod credentials;
pub mod protocol;
pub mod status;
pub mod util;

pub use command::{classify, parse_direct_message, Command, DirectMessage};
pub use credentials::{CredentialStore, FileCredentialStore, StaticCredentials};
pub use protocol::{clean_line, format_notice, Notice, HELP_TEXT, MAX_LINE, WELCOME_BANNER};
pub use status::Status;
