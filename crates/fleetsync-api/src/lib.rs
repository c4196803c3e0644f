// fleetsync-api: Device command contracts and notification model

pub mod client;
pub mod error;
pub mod notification;

pub use client::{
    DeviceCommandClient, DeviceContext, DeviceMetaInfo, DiffChange, DiffEntry, DiffReport,
    DomainStatus, OperationalState, PolicyPayload, QuiesceState, SubscriptionRequest,
    SubscriptionState,
};
pub use error::Error;
pub use notification::{DEFAULT_DOMAIN, Notification, NotificationKind};
