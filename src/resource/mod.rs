//! Resource lists: the byte codec and the search engine over it.

pub mod codec;
pub mod search;

pub use self::codec::Resource;
pub use self::codec::ResourceError;
pub use self::codec::ResourceList;
pub use self::search::ResourceSearch;
pub use self::search::SearchMode;
