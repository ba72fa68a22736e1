use std::{io, net::ToSocketAddrs, time::Duration};

use ucp_protocol::{MAX_WORDS_PER_DATAGRAM, max_words_for_mtu};

use crate::Connection;

#[derive(Debug, Clone)]
pub struct Config {
    /// How long to wait for a reply before the command is sent again
    pub timeout: Duration,
    /// How often a command is resent after the first attempt timed out
    pub retries: u32,
    /// MTU of the link to the board, used to derive the payload size of a packet
    pub mtu: usize,
    /// Overrides the number of words per packet derived from the MTU
    pub max_words: Option<usize>,
}

impl Config {
    /// Maximum number of payload words in a single packet. Never zero, and never more
    /// than one UDP datagram can carry.
    pub fn max_words_per_packet(&self) -> usize {
        self.max_words
            .unwrap_or_else(|| max_words_for_mtu(self.mtu))
            .clamp(1, MAX_WORDS_PER_DATAGRAM)
    }

    /// Total number of times a command is sent before giving up.
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            retries: 3,
            mtu: 1500,
            max_words: None,
        }
    }
}

/// Builder to create a [Connection] with modified configuration options
///
/// # Example
///
/// ```no_run
/// use ucp_client::Builder;
/// use std::time::Duration;
///
/// let connection = Builder::new()
///     .timeout(Duration::from_millis(500))
///     .retries(5)
///     .connect("10.0.10.2:10000")?;
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set how long to wait for each reply
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set how often an unanswered command is sent again
    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Set the MTU of the link to the board
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set the number of words per packet explicitly instead of deriving it from the MTU
    pub fn max_words_per_packet(mut self, words: usize) -> Self {
        self.config.max_words = Some(words);
        self
    }

    /// Return the configuration without connecting
    pub fn build(self) -> Config {
        self.config
    }

    /// Connect to the board
    pub fn connect(self, addr: impl ToSocketAddrs) -> io::Result<Connection> {
        Connection::connect(addr, self.config)
    }
}

#[test]
fn words_per_packet() {
    assert_eq!(Config::default().max_words_per_packet(), 364);
    assert_eq!(Builder::new().mtu(556).build().max_words_per_packet(), 128);
    assert_eq!(
        Builder::new()
            .max_words_per_packet(4)
            .build()
            .max_words_per_packet(),
        4
    );
    assert_eq!(
        Builder::new()
            .max_words_per_packet(0)
            .build()
            .max_words_per_packet(),
        1
    );
    assert_eq!(
        Builder::new()
            .max_words_per_packet(20_000)
            .build()
            .max_words_per_packet(),
        16372
    );
    assert_eq!(
        Builder::new().mtu(100_000).build().max_words_per_packet(),
        16372
    );
}

#[test]
fn attempts_include_first_send() {
    assert_eq!(Builder::new().retries(0).build().attempts(), 1);
    assert_eq!(Config::default().attempts(), 4);
}
