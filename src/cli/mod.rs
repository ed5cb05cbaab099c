pub mod hooks_bridge;
pub mod tool_cmd;
