pub(crate) mod support;

mod session_flow;
