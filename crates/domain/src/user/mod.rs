//! User aggregate events.

mod events;

pub use events::{
    DEFAULT_EMAIL, DEFAULT_NAME, USER_BALANCE, USER_CREATED, UserBalanceData, UserCreatedData,
    UserEvent,
};
