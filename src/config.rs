use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Single-mailbox shorthand; merged ahead of `inboxes`.
    #[serde(default)]
    pub imap: Option<MailboxConfig>,
    #[serde(default)]
    pub inboxes: Vec<MailboxConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
}

impl MailboxConfig {
    /// Identifier used in logs and per-mailbox error entries.
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.mailbox)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_db_path(),
        }
    }
}

fn default_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_use_tls() -> bool {
    true
}

fn default_db_path() -> String {
    "./dmarc.db".to_string()
}

fn default_fetch_interval() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Config {
            imap: Some(MailboxConfig {
                host: "imap.example.com".to_string(),
                port: 993,
                username: "dmarc-reports@example.com".to_string(),
                password: "your-password".to_string(),
                mailbox: "INBOX".to_string(),
                use_tls: true,
            }),
            inboxes: Vec::new(),
            database: DatabaseConfig::default(),
            fetch_interval_seconds: default_fetch_interval(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// All configured mailboxes in a stable order: the single `imap`
    /// entry first, then the `inboxes` list.
    pub fn mailbox_configs(&self) -> Vec<MailboxConfig> {
        self.imap
            .iter()
            .chain(self.inboxes.iter())
            .cloned()
            .collect()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mailboxes = self.mailbox_configs();
        if mailboxes.is_empty() {
            anyhow::bail!("no mailboxes configured: set `imap` or `inboxes`");
        }
        for mailbox in &mailboxes {
            if mailbox.host.is_empty() {
                anyhow::bail!("mailbox entry is missing a host");
            }
            if mailbox.username.is_empty() {
                anyhow::bail!("mailbox {} is missing a username", mailbox.host);
            }
        }
        if self.database.path.is_empty() {
            anyhow::bail!("database.path must not be empty");
        }
        Ok(())
    }
}
