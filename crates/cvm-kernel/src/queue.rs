use std::collections::VecDeque;

use cvm_abi::ContractMessage;

/// FIFO of pending contract calls for one dispatch.
#[derive(Debug, Default)]
pub struct CallbackQueue {
    messages: VecDeque<ContractMessage>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: ContractMessage) {
        self.messages.push_back(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = ContractMessage>) {
        self.messages.extend(messages);
    }

    pub fn dequeue(&mut self) -> Option<ContractMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
