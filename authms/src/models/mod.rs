pub mod api_key;
pub mod history;
pub mod session_token;
pub mod user;
pub mod verification_code;

pub use api_key::ApiKey;
pub use history::{History, HistoryAction};
pub use session_token::{Claims, GroupClaim, IssuedToken, PersistedToken};
pub use user::{
    default_access_level, Binding, DeviceBinding, Group, LoginType, User, UserRecord, UserType,
    UserTypeName, GROUP_ADMIN, GROUP_PUBLIC, GROUP_STAFF, GROUP_SUPER,
};
pub use verification_code::{Channel, VerificationCode};
