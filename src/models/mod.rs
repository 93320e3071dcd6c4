mod device;
mod entity;
mod event;
mod queue;

pub use device::{Device, DeviceIdentity};
pub use entity::{apply_operation, EntityType, Operation};
pub use event::{EntityHead, NewEvent, SyncEvent};
pub use queue::OfflineQueueEntry;
