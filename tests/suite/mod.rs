mod agent_loop;
mod config;
mod message;
mod sse_stream;
