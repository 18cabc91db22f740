//! Wire and data types shared between the agent execution core and its
//! submitters (CLI, server). This crate is deliberately I/O-free: everything
//! here is plain data with serde derives.

mod models;
mod stream;
mod work_item;

pub use models::Message;
pub use models::Part;
pub use models::Role;
pub use models::history_from_json;
pub use models::history_to_json;
pub use stream::StreamEvent;
pub use work_item::Decision;
pub use work_item::DecisionsSubmission;
pub use work_item::DeferredRequestsPayload;
pub use work_item::Priority;
pub use work_item::ToolCallRequest;
pub use work_item::WorkItem;
pub use work_item::WorkItemInput;
pub use work_item::WorkItemOutput;
pub use work_item::WorkItemType;
