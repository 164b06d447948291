//! Cursor over a [`MemoryStore`](super::MemoryStore)
//!
//! The cursor holds the key it points at, not an iterator, so it never pins
//! the records lock between calls. Every move re-seeks from that key. If the
//! record under the cursor was removed by someone else, reads land on the
//! next record after it.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{EngineError, EngineResult};

use super::memory::{Records, StoreCore};
use super::StoreCursor;

pub struct MemoryCursor {
    core: Arc<StoreCore>,
    position: Option<Bytes>,
}

fn no_record() -> EngineError {
    EngineError::not_found("no record")
}

impl MemoryCursor {
    pub(crate) fn new(core: Arc<StoreCore>) -> Self {
        Self {
            core,
            position: None,
        }
    }

    /// Move to `target`, or clear the position when there is none
    fn settle(&mut self, target: Option<&Bytes>) -> EngineResult<()> {
        match target {
            Some(key) => {
                self.position = Some(key.clone());
                Ok(())
            }
            None => {
                self.position = None;
                Err(no_record())
            }
        }
    }

    fn seek<F>(&mut self, find: F) -> EngineResult<()>
    where
        F: FnOnce(&Records, Option<&Bytes>) -> Option<Bytes>,
    {
        let position = self.position.clone();
        let target = self.core.read(|records| find(records, position.as_ref()))?;
        self.settle(target.as_ref())
    }

    /// Current record plus the key after it
    fn current(
        records: &Records,
        position: Option<&Bytes>,
    ) -> Option<(Bytes, Bytes, Option<Bytes>)> {
        let (key, value) = records.at_or_after(position?)?;
        let next = records.after(key).map(|(k, _)| k.clone());
        Some((key.clone(), value.clone(), next))
    }

    fn read_current(&mut self, step: bool) -> EngineResult<(Bytes, Bytes)> {
        let position = self.position.clone();
        let found = self
            .core
            .read(|records| Self::current(records, position.as_ref()))?;

        match found {
            Some((key, value, next)) => {
                self.position = if step { next } else { Some(key.clone()) };
                Ok((key, value))
            }
            None => {
                self.position = None;
                Err(no_record())
            }
        }
    }
}

impl StoreCursor for MemoryCursor {
    fn jump(&mut self) -> EngineResult<()> {
        self.seek(|records, _| records.first().map(|(k, _)| k.clone()))
    }

    fn jump_to(&mut self, key: &[u8]) -> EngineResult<()> {
        self.seek(|records, _| records.at_or_after(key).map(|(k, _)| k.clone()))
    }

    fn jump_back(&mut self) -> EngineResult<()> {
        self.seek(|records, _| records.last().map(|(k, _)| k.clone()))
    }

    fn jump_back_to(&mut self, key: &[u8]) -> EngineResult<()> {
        self.seek(|records, _| records.at_or_before(key).map(|(k, _)| k.clone()))
    }

    fn step(&mut self) -> EngineResult<()> {
        if self.position.is_none() {
            return Err(no_record());
        }
        self.seek(|records, position| {
            let position = position?;
            // Stepping from a vanished record lands on its successor
            match records.get(position) {
                Some(_) => records.after(position).map(|(k, _)| k.clone()),
                None => records.at_or_after(position).map(|(k, _)| k.clone()),
            }
        })
    }

    fn step_back(&mut self) -> EngineResult<()> {
        if self.position.is_none() {
            return Err(no_record());
        }
        self.seek(|records, position| {
            records.before(position?).map(|(k, _)| k.clone())
        })
    }

    fn get(&mut self, step: bool) -> EngineResult<(Bytes, Bytes)> {
        self.read_current(step)
    }

    fn get_key(&mut self, step: bool) -> EngineResult<Bytes> {
        self.read_current(step).map(|(key, _)| key)
    }

    fn get_value(&mut self, step: bool) -> EngineResult<Bytes> {
        self.read_current(step).map(|(_, value)| value)
    }

    fn set_value(&mut self, value: &[u8], step: bool) -> EngineResult<()> {
        let position = self.position.clone().ok_or_else(no_record)?;
        let value = Bytes::copy_from_slice(value);

        let moved = self.core.write(|scope| {
            let Some((key, _, next)) = Self::current(scope.records(), Some(&position)) else {
                return Ok(None);
            };
            scope.insert(key.clone(), value);
            Ok(Some(if step { next } else { Some(key) }))
        })?;

        match moved {
            Some(position) => {
                self.position = position;
                Ok(())
            }
            None => {
                self.position = None;
                Err(no_record())
            }
        }
    }

    fn remove(&mut self) -> EngineResult<()> {
        let position = self.position.clone().ok_or_else(no_record)?;

        let moved = self.core.write(|scope| {
            let Some((key, _, next)) = Self::current(scope.records(), Some(&position)) else {
                return Ok(None);
            };
            scope.remove(&key);
            Ok(Some(next))
        })?;

        match moved {
            Some(next) => {
                self.position = next;
                Ok(())
            }
            None => {
                self.position = None;
                Err(no_record())
            }
        }
    }
}
