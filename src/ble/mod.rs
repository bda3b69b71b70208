//! BLE transport: the abstract backend/client capability consumed by the
//! bridge core and its `bluest` implementation.

pub mod backend;
pub mod scanner;
pub mod uuids;

pub use backend::{AddressType, BleBackend, BleClient, BluestBackend};
pub use scanner::{Advertisement, SeenDevice};
