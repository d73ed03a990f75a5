//! Ollama chat server binary.
//! Run with: cargo run --bin ollama-chat-server

use std::process::ExitCode;

use ollama_chat::start_chat_server;

fn main() -> ExitCode {
    start_chat_server::run()
}
