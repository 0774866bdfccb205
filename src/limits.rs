/// Max length of a room name in bytes.
pub const MAX_NAME_LEN: usize = 256;

/// Max length of a category name in bytes.
pub const MAX_CATEGORY_NAME_LEN: usize = 64;

/// Max categories attached to one session.
pub const MAX_CATEGORIES_PER_SESSION: usize = 16;

/// Max sessions scheduled in one room.
pub const MAX_SESSIONS_PER_ROOM: usize = 10_000;

/// Max identifiers accepted by a single session listing.
pub const MAX_IDS_PER_QUERY: usize = 50_000;

/// Max participants a single session may accept.
pub const MAX_PARTICIPANTS: u32 = 1_000;

/// Max payload of one journal frame. A larger length header is corruption.
pub const MAX_WAL_FRAME_LEN: usize = 16 * 1024 * 1024;
