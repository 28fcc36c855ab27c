//! Cancellable operation context.
//!
//! Every snapshotter/metastore operation takes a `&Context`. It is checked:
//! - before a transaction is opened,
//! - while waiting for the writer slot,
//! - right before a write transaction commits (cancelled => rollback).
//!
//! Context is cheap to clone; children created with `with_cancel()` observe the
//! cancellation of all their ancestors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::{Error, Result};

#[derive(Clone, Debug, Default)]
pub struct Context {
    flags: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

/// Handle that cancels the context it was created with (and its children).
#[derive(Clone, Debug)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Context {
    /// Корневой контекст: без отмены и без дедлайна.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut child = self.clone();
        child.flags.push(flag.clone());
        (child, CancelHandle { flag })
    }

    /// Child context with a deadline (the earlier of the parent's and now+timeout).
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        let at = Instant::now() + timeout;
        let mut child = self.clone();
        child.deadline = Some(match self.deadline {
            Some(d) if d < at => d,
            _ => at,
        });
        child
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.err().is_err()
    }

    /// Ok while the context is live; Cancelled / DeadlineExceeded otherwise.
    pub fn err(&self) -> Result<()> {
        if self.flags.iter().any(|f| f.load(Ordering::SeqCst)) {
            return Err(Error::Cancelled);
        }
        if let Some(d) = self.deadline {
            if Instant::now() >= d {
                return Err(Error::DeadlineExceeded);
            }
        }
        Ok(())
    }
}
