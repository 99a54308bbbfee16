pub mod changelog;
pub mod changenum;
pub mod config;
pub mod connection;
pub mod future;
pub mod ldap_protocol;
pub mod pending;
pub mod replication;
pub mod server;
pub mod tls;

pub use changelog::{ChangeLog, ChangelogDb, DraftCnDb, StoreError, TrimWorker};
pub use changenum::{ChangeNumber, CsnGenerator, ServerState};
pub use config::Config;
pub use connection::{ConnectError, ConnectionFactory, ConnectionSecurity, LdapConnection};
pub use future::{CompletionHandle, LdapFuture, OperationError};
pub use replication::ReplicationServer;
pub use server::{ClientContext, LdapServer, ServerConnection, ServerConnectionFactory};
