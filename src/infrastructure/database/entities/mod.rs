pub mod archived_op;
pub mod kv;
pub mod node;
pub mod node_parent;
pub mod op;
pub mod path_uid;
