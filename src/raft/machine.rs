use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::RaftError;

/// Receives committed commands, strictly in log order, on every node.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&mut self, index: u64, command: &[u8]) -> Result<Vec<u8>, RaftError>;
}

/// Accepts every command and answers with an empty result.
#[derive(Debug, Default)]
pub struct NoopMachine;

impl StateMachine for NoopMachine {
    fn apply(&mut self, _index: u64, _command: &[u8]) -> Result<Vec<u8>, RaftError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum KvCommand {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Vec<u8> {
        // Serialising a plain enum of strings cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvResult {
    pub key: String,
    pub value: Option<String>,
}

/// In-memory key/value store driven by JSON [`KvCommand`]s.
#[derive(Debug, Default)]
pub struct KvMachine {
    data: BTreeMap<String, String>,
}

impl KvMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StateMachine for KvMachine {
    fn apply(&mut self, index: u64, command: &[u8]) -> Result<Vec<u8>, RaftError> {
        let command: KvCommand = serde_json::from_slice(command)
            .map_err(|e| RaftError::StateMachine(format!("bad command at index {index}: {e}")))?;

        let result = match command {
            KvCommand::Put { key, value } => {
                let previous = self.data.insert(key.clone(), value);
                KvResult {
                    key,
                    value: previous,
                }
            }
            KvCommand::Get { key } => {
                let value = self.data.get(&key).cloned();
                KvResult { key, value }
            }
            KvCommand::Delete { key } => {
                let value = self.data.remove(&key);
                KvResult { key, value }
            }
        };

        serde_json::to_vec(&result).map_err(|e| RaftError::StateMachine(e.to_string()))
    }
}
