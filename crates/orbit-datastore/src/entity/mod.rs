//! Groups and subjects

mod group;
mod subject;

pub use group::{Group, GroupDisplay, GroupRecord, DEFAULT_GROUP_NAME};
pub use subject::{Subject, SubjectRecord};
