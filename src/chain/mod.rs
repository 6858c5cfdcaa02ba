pub mod accounts;
pub mod block;
pub mod oracle;
pub mod stats;
pub mod transaction;
