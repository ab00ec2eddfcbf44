pub mod fjall;
pub mod keys;
pub mod mem;
pub mod traits;

pub use self::fjall::FjallStore;
pub use mem::MemStore;
pub use traits::KvStore;
