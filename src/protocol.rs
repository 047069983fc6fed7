//! Shared protocol constants for the treesync framed transport

// Default TCP port for treesyncd
pub const DEFAULT_PORT: u16 = 8888;

// Length prefix width (big-endian u32) in front of every frame
pub const LENGTH_PREFIX_LEN: usize = 4;

// Maximum header frame size (64MB) - a full registry travels in one header
// frame, so this bounds the tree size rather than any single file
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// Maximum content frame size (1GB) - whole files are held in memory
pub const MAX_CONTENT_SIZE: usize = 1024 * 1024 * 1024;

// Entries whose name starts with this are internal (temp files, cache dir)
// and never scanned, watched, or synced
pub const RESERVED_PREFIX: &str = ".treesync";

// Directory under the sync root holding the registry cache
pub const CACHE_DIR: &str = ".treesync";

// Message type tags as they appear in the JSON header ("type" key)
pub mod tag {
    pub const FILE_REGISTRY: &str = "file_registry";
    pub const CLIENT_REGISTRY: &str = "client_registry";
    pub const SYNC_UPDATES: &str = "sync_updates";
    pub const REQUEST_FILE: &str = "request_file";
    pub const FILE_CONTENT: &str = "file_content";
    pub const FILE_NOT_FOUND: &str = "file_not_found";
    pub const UPLOAD_FILE: &str = "upload_file";
    pub const FILE_UPDATED: &str = "file_updated";
}

// Centralized timeout constants shared by server and client
pub mod timeouts {
    // Base timeout for the payload that follows a length prefix (ms)
    pub const READ_BASE_MS: u64 = 5_000;

    // Base timeout for writing one frame (ms)
    pub const WRITE_BASE_MS: u64 = 5_000;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 100;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Calculate write deadline based on payload size (ms)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        WRITE_BASE_MS + mb * PER_MB_MS
    }

    // Calculate read deadline based on payload size (ms)
    pub fn read_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        READ_BASE_MS + mb * PER_MB_MS
    }
}
