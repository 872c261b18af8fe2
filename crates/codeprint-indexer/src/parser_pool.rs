//! Thread-safe parser pool for tree-sitter-python
//!
//! Tree-sitter parsers are not `Sync`, so each worker thread owns one parser
//! and requests are handed over a channel.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use tree_sitter::{Language, Parser};

pub fn python_language() -> Language {
    tree_sitter_python::LANGUAGE.into()
}

/// A parsing request sent to the parser pool
#[derive(Debug)]
pub struct ParseRequest {
    pub content: String,
    pub path: PathBuf,
}

/// Result of a parsing operation
#[derive(Debug)]
pub struct ParseResult {
    pub tree: tree_sitter::Tree,
    pub path: PathBuf,
    pub content: String,
}

#[derive(Debug)]
struct WorkerRequest {
    request: ParseRequest,
    response_sender: Sender<Result<ParseResult>>,
}

/// Thread-safe parser pool
#[derive(Clone)]
pub struct ParserPool {
    sender: Sender<WorkerRequest>,
}

impl ParserPool {
    /// Create a new parser pool with the specified number of worker threads
    pub fn new(num_workers: usize) -> Self {
        let (sender, receiver) = std::sync::mpsc::channel::<WorkerRequest>();
        let receiver = Arc::new(Mutex::new(receiver));

        for i in 0..num_workers.max(1) {
            let receiver = Arc::clone(&receiver);
            std::thread::spawn(move || {
                Self::worker_thread(i, receiver);
            });
        }

        Self { sender }
    }

    fn worker_thread(worker_id: usize, receiver: Arc<Mutex<Receiver<WorkerRequest>>>) {
        tracing::debug!("Parser worker {} started", worker_id);

        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(&python_language()) {
            tracing::error!("Parser worker {} cannot load the Python grammar: {}", worker_id, e);
            return;
        }

        loop {
            // The guard is dropped before parsing so other workers can receive.
            let next = receiver.lock().unwrap_or_else(|e| e.into_inner()).recv();
            let WorkerRequest { request, response_sender } = match next {
                Ok(req) => req,
                Err(_) => {
                    tracing::debug!("Parser worker {} shutting down", worker_id);
                    break;
                }
            };

            let result = match parser.parse(&request.content, None) {
                Some(tree) => Ok(ParseResult {
                    tree,
                    path: request.path,
                    content: request.content,
                }),
                None => Err(anyhow::anyhow!("Failed to parse {}", request.path.display())),
            };

            if response_sender.send(result).is_err() {
                tracing::warn!("Failed to send parse result back to caller");
            }
        }
    }

    /// Parse content, blocking the current thread until a worker is done
    pub fn parse_blocking(&self, request: ParseRequest) -> Result<ParseResult> {
        let (response_sender, response_receiver) = std::sync::mpsc::channel();

        self.sender
            .send(WorkerRequest {
                request,
                response_sender,
            })
            .map_err(|_| anyhow::anyhow!("Parser pool is shut down"))?;

        response_receiver
            .recv()
            .map_err(|_| anyhow::anyhow!("Parser worker died"))?
    }
}

/// Parser pool sized to the machine, but at least 2 workers
pub fn create_parser_pool() -> ParserPool {
    let num_workers = std::thread::available_parallelism()
        .map(|n| n.get().max(2))
        .unwrap_or(2);

    ParserPool::new(num_workers)
}
