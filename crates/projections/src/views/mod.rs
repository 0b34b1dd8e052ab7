//! Projections that maintain the user read models.

pub mod user_detail;
pub mod user_summary;

pub use user_detail::UserDetailProjection;
pub use user_summary::UserSummaryProjection;
