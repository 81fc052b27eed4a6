pub mod audit;
pub mod db;
pub mod errors;
pub mod ids;
pub mod model;
pub mod names;
pub mod roles;
pub mod store;

pub use audit::AuditEntry;
pub use errors::{ControlError, ControlResult};
pub use ids::{ChannelId, ClientId, MsgId};
pub use model::{BanRecord, ChannelInfo, IceServer, StoredMsg};
pub use names::{validate_name, NameError, MAX_NAME_LEN};
pub use roles::{Action, Role};
pub use store::{NullStore, PersistedState, StoreHooks};
