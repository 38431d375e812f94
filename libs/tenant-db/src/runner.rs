//! Sealed runner capability.
//!
//! `DbRunner` is implemented only by [`DbConn`] and [`DbTx`], the handles the
//! scope manager and the transaction coordinator pass to units of work.
//! Downstream crates cannot implement it, and cannot reach the pooled
//! connection behind it except through the protocol helpers.

use crate::context::DbConn;
use crate::engine::{Connector, StorageConn};
use crate::scope::ScopeState;
use crate::tx::DbTx;

mod sealed {
    pub trait Sealed {}
}

mod internal {
    use super::{ScopeState, StorageConn};

    /// Crate-only bridge to the storage connection behind a runner.
    pub trait RunnerInternal: super::sealed::Sealed + Send {
        type Conn: StorageConn;

        fn storage(&mut self) -> &mut Self::Conn;

        fn scope(&self) -> ScopeState;
    }
}

pub(crate) use internal::RunnerInternal;

/// Handle on a scoped connection, accepted by the protocol helpers.
#[doc(hidden)]
pub trait DbRunner: internal::RunnerInternal {}

impl<C: Connector> sealed::Sealed for DbConn<'_, C> {}
impl<C: Connector> internal::RunnerInternal for DbConn<'_, C> {
    type Conn = C::Conn;

    fn storage(&mut self) -> &mut C::Conn {
        self.lease.conn_mut()
    }

    fn scope(&self) -> ScopeState {
        self.lease.scope()
    }
}
impl<C: Connector> DbRunner for DbConn<'_, C> {}

impl<C: Connector> sealed::Sealed for DbTx<'_, C> {}
impl<C: Connector> internal::RunnerInternal for DbTx<'_, C> {
    type Conn = C::Conn;

    fn storage(&mut self) -> &mut C::Conn {
        self.lease.conn_mut()
    }

    fn scope(&self) -> ScopeState {
        self.lease.scope()
    }
}
impl<C: Connector> DbRunner for DbTx<'_, C> {}
