pub mod json;
pub mod response;
pub mod search;
