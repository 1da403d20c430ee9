//! Configuration of the exploit controller.

use std::time::Duration;

/// Gap size assumed when nothing better is known.
pub const DEFAULT_ESTIMATED_GAP_SIZE: u32 = 0x60000;
/// Size of the forged header allocation when none is configured.
pub const DEFAULT_HEADER_ALLOCATION_SIZE: u32 = 0x20000;
/// How long the device gets to come back on its own after a reset.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(40);
pub const DEFAULT_ASYNC_BUFFER_COUNT: u32 = 4;
/// Partition copied to RAM when backup buffers are allocated first.
pub const DEFAULT_BACKUP_PARTITION: &str = "BACKUP_BS_NV";

/// Options of one flashing run.
///
/// # Example
///
/// ```
/// use forgeflash::config::ExploitConfig;
///
/// let config = ExploitConfig::builder()
///     .experimental(true)
///     .estimated_gap_size(0x80000)
///     .suppress_commit(true)
///     .build();
/// assert_eq!(config.estimated_gap_size, 0x80000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExploitConfig {
    /// Chunk size the caller expects the image to use. Checked against the
    /// image when set.
    pub chunk_size: Option<u32>,
    /// Also searches the backup-buffer dimension and widens the gap walk.
    pub experimental: bool,
    pub estimated_gap_size: u32,
    pub header_allocation_size: u32,
    pub reconnect_timeout: Duration,
    /// Crashes the device on its way down instead of letting it commit its
    /// state.
    pub suppress_commit: bool,
    pub async_buffer_count: u32,
    pub backup_partition: String,
    /// Loader used to bring a device back from emergency download mode.
    pub emergency_loader: Option<Vec<u8>>,
    /// Hides or unhides the backdoor partition in the transmitted table.
    pub backdoor: Option<bool>,
    /// Plans one payload per chunk, without content deduplication.
    pub disable_dedup: bool,
}

impl Default for ExploitConfig {
    fn default() -> Self {
        ExploitConfig {
            chunk_size: None,
            experimental: false,
            estimated_gap_size: DEFAULT_ESTIMATED_GAP_SIZE,
            header_allocation_size: DEFAULT_HEADER_ALLOCATION_SIZE,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            suppress_commit: false,
            async_buffer_count: DEFAULT_ASYNC_BUFFER_COUNT,
            backup_partition: DEFAULT_BACKUP_PARTITION.to_string(),
            emergency_loader: None,
            backdoor: None,
            disable_dedup: false,
        }
    }
}

impl ExploitConfig {
    pub fn builder() -> ExploitConfigBuilder {
        ExploitConfigBuilder {
            config: ExploitConfig::default(),
        }
    }
}

pub struct ExploitConfigBuilder {
    config: ExploitConfig,
}

impl ExploitConfigBuilder {
    pub fn build(self) -> ExploitConfig {
        self.config
    }

    /// Sets the chunk size the image must use.
    pub fn chunk_size(mut self, chunk_size: u32) -> Self {
        self.config.chunk_size = Some(chunk_size);
        self
    }

    /// Enables the experimental search if set to `true`.
    pub fn experimental(mut self, experimental: bool) -> Self {
        self.config.experimental = experimental;
        self
    }

    /// Sets the size the gap walk starts from.
    pub fn estimated_gap_size(mut self, size: u32) -> Self {
        self.config.estimated_gap_size = size;
        self
    }

    /// Sets the content size of the forged header allocation.
    pub fn header_allocation_size(mut self, size: u32) -> Self {
        self.config.header_allocation_size = size;
        self
    }

    /// Sets how long to wait for the device before asking for a manual reset.
    pub fn reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.config.reconnect_timeout = timeout;
        self
    }

    /// Suppresses the device's state commit if set to `true`.
    pub fn suppress_commit(mut self, suppress: bool) -> Self {
        self.config.suppress_commit = suppress;
        self
    }

    pub fn async_buffer_count(mut self, count: u32) -> Self {
        self.config.async_buffer_count = count;
        self
    }

    pub fn backup_partition(mut self, name: impl Into<String>) -> Self {
        self.config.backup_partition = name.into();
        self
    }

    /// Sets the loader used to recover a device in emergency download mode.
    pub fn emergency_loader(mut self, loader: Vec<u8>) -> Self {
        self.config.emergency_loader = Some(loader);
        self
    }

    pub fn backdoor(mut self, enabled: bool) -> Self {
        self.config.backdoor = Some(enabled);
        self
    }

    /// Disables content deduplication if set to `true`.
    pub fn disable_dedup(mut self, disable: bool) -> Self {
        self.config.disable_dedup = disable;
        self
    }
}
