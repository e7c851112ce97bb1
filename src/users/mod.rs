pub mod user_manager;

pub use user_manager::{
    InMemoryUserManager, PushButtonAuthResult, PushButtonListener, TokenInfo, UserError, UserManager,
};
