use std::env::var;

/// Service configuration, read from the environment.
pub struct Config {
    pub port: u16,
    pub organization_url: String,
    pub backend_fast: String,
    pub backend_long: String,
    /// Secret half of the service signing key, hex encoded. A volatile key
    /// is generated when unset.
    pub main_key: Option<Vec<u8>>,
    /// Directory for the filesystem key store; the in-memory store is used
    /// when unset.
    pub keystore_path: Option<String>,
    pub decrypt_workers: Option<usize>,
    pub max_votes: Option<usize>,
    /// Upper bound for the blocking vote-count long poll in seconds.
    pub long_poll_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let port = match var("VOTE_PORT") {
            Ok(val) => val
                .parse()
                .unwrap_or_else(|_| panic!("VOTE_PORT has to be a port number, not {}", val)),
            Err(_) => 9013,
        };

        let main_key = match var("VOTE_MAIN_KEY") {
            Ok(val) => {
                let bytes = hex::decode(&val)
                    .unwrap_or_else(|_| panic!("VOTE_MAIN_KEY has to be hex encoded"));
                Some(bytes)
            }
            Err(_) => None,
        };

        Config {
            port,
            organization_url: var("VOTE_ORGANIZATION_URL")
                .unwrap_or_else(|_| "http://localhost".to_string()),
            backend_fast: var("VOTE_BACKEND_FAST").unwrap_or_else(|_| "memory".to_string()),
            backend_long: var("VOTE_BACKEND_LONG").unwrap_or_else(|_| "memory".to_string()),
            main_key,
            keystore_path: var("VOTE_KEYSTORE_PATH").ok().filter(|path| !path.is_empty()),
            decrypt_workers: parse_optional("VOTE_DECRYPT_WORKERS"),
            max_votes: parse_optional("VOTE_MAX_VOTES"),
            long_poll_secs: parse_optional("VOTE_LONG_POLL_SECONDS").unwrap_or(30),
        }
    }
}

fn parse_optional<T: std::str::FromStr>(name: &str) -> Option<T> {
    match var(name) {
        Ok(val) => Some(
            val.parse()
                .unwrap_or_else(|_| panic!("{} has to be a number, not {}", name, val)),
        ),
        Err(_) => None,
    }
}
