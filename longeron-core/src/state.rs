//! Socket state machines: flow control, open state, shutdown sequencing.
//!
//! These types capture the per-socket bookkeeping that decides which I/O
//! directions make progress and how a socket winds down. None of them are
//! thread safe; the owning socket guards them with its own mutex.

/// The I/O direction(s) affected by a flow control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlType {
    /// The send direction.
    Send,
    /// The receive direction.
    Receive,
    /// Both directions.
    Both,
}

/// The result of a flow control operation: the per-direction enablement
/// after the operation took effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowControlContext {
    enable_send: bool,
    enable_receive: bool,
}

impl FlowControlContext {
    /// True if the socket wants to send after the operation.
    #[must_use]
    pub fn enable_send(&self) -> bool {
        self.enable_send
    }

    /// True if the socket wants to receive after the operation.
    #[must_use]
    pub fn enable_receive(&self) -> bool {
        self.enable_receive
    }
}

/// The per-direction enable/lock discipline that suppresses or resumes
/// read and write progress.
///
/// `apply` never re-enables a direction and `relax` never disables one; a
/// locked direction ignores both until explicitly unlocked. Once closed,
/// no transition re-enables anything.
#[derive(Debug, Default)]
pub struct FlowControlState {
    enable_send: bool,
    enable_receive: bool,
    lock_send: bool,
    lock_receive: bool,
    closed: bool,
}

impl FlowControlState {
    /// Create a new state with both directions disabled and unlocked.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply flow control of the specified `kind`, disabling the affected
    /// direction(s), and lock them when `lock` is set. Returns true and
    /// loads `context` iff an observable change occurred.
    pub fn apply(
        &mut self,
        context: &mut FlowControlContext,
        kind: FlowControlType,
        lock: bool,
    ) -> bool {
        *context = FlowControlContext::default();

        if self.closed {
            return false;
        }

        let mut result = false;
        let (apply_send, apply_receive) = direction_mask(kind);

        if apply_send {
            if !self.lock_send && self.enable_send {
                self.enable_send = false;
                result = true;
            }
            if lock {
                self.lock_send = true;
            }
        }

        if apply_receive {
            if !self.lock_receive && self.enable_receive {
                self.enable_receive = false;
                result = true;
            }
            if lock {
                self.lock_receive = true;
            }
        }

        context.enable_send = self.enable_send;
        context.enable_receive = self.enable_receive;
        result
    }

    /// Relax flow control of the specified `kind`, enabling the affected
    /// direction(s) where not locked, unlocking first when `unlock` is set.
    /// Returns true and loads `context` iff an observable change occurred.
    pub fn relax(
        &mut self,
        context: &mut FlowControlContext,
        kind: FlowControlType,
        unlock: bool,
    ) -> bool {
        *context = FlowControlContext::default();

        if self.closed {
            return false;
        }

        let mut result = false;
        let (relax_send, relax_receive) = direction_mask(kind);

        if relax_send {
            if unlock {
                self.lock_send = false;
            }
            if !self.lock_send && !self.enable_send {
                self.enable_send = true;
                result = true;
            }
        }

        if relax_receive {
            if unlock {
                self.lock_receive = false;
            }
            if !self.lock_receive && !self.enable_receive {
                self.enable_receive = true;
                result = true;
            }
        }

        context.enable_send = self.enable_send;
        context.enable_receive = self.enable_receive;
        result
    }

    /// Query which of the affected direction(s) a one-shot demultiplexer
    /// should re-arm: those enabled and unlocked. Returns true and loads
    /// `context` iff any direction should be re-armed.
    pub fn rearm(
        &self,
        context: &mut FlowControlContext,
        kind: FlowControlType,
        one_shot: bool,
    ) -> bool {
        *context = FlowControlContext::default();

        if !one_shot || self.closed {
            return false;
        }

        let mut result = false;
        let (rearm_send, rearm_receive) = direction_mask(kind);

        if rearm_send && self.enable_send {
            debug_assert!(!self.lock_send);
            result = true;
        }
        if rearm_receive && self.enable_receive {
            debug_assert!(!self.lock_receive);
            result = true;
        }

        context.enable_send = self.enable_send;
        context.enable_receive = self.enable_receive;
        result
    }

    /// Disable and unlock both directions permanently.
    pub fn close(&mut self) {
        self.enable_send = false;
        self.enable_receive = false;
        self.lock_send = false;
        self.lock_receive = false;
        self.closed = true;
    }

    /// Reset to the state at construction.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// True if the socket can and wants to send more data.
    #[must_use]
    pub fn want_send(&self) -> bool {
        self.enable_send
    }

    /// True if the socket can and wants to receive more data.
    #[must_use]
    pub fn want_receive(&self) -> bool {
        self.enable_receive
    }

    /// True if the send direction is locked.
    #[must_use]
    pub fn lock_send(&self) -> bool {
        self.lock_send
    }

    /// True if the receive direction is locked.
    #[must_use]
    pub fn lock_receive(&self) -> bool {
        self.lock_receive
    }

    /// True if the state has been closed.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.closed
    }
}

fn direction_mask(kind: FlowControlType) -> (bool, bool) {
    match kind {
        FlowControlType::Send => (true, false),
        FlowControlType::Receive => (false, true),
        FlowControlType::Both => (true, true),
    }
}

/// The lifecycle of a socket from construction to close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenState {
    /// The initial state after construction.
    #[default]
    Default,
    /// Waiting to retry connecting.
    Waiting,
    /// A connect attempt is in flight.
    Connecting,
    /// The socket is established.
    Connected,
    /// The socket has been closed. Terminal.
    Closed,
}

impl OpenState {
    /// True if the state permits a bind operation.
    #[must_use]
    pub fn can_bind(self) -> bool {
        self == Self::Default
    }

    /// True if the state permits a connect operation.
    #[must_use]
    pub fn can_connect(self) -> bool {
        self == Self::Default
    }

    /// True if the state permits a send operation.
    #[must_use]
    pub fn can_send(self) -> bool {
        self == Self::Connected
    }

    /// True if the state permits a receive operation. Receiving is allowed
    /// after close so queued input can still be drained.
    #[must_use]
    pub fn can_receive(self) -> bool {
        self == Self::Connected || self == Self::Closed
    }
}

/// The party that instigated shutting down a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOrigin {
    /// The local user of the socket.
    Source,
    /// The remote peer, detected by reading end-of-file.
    Remote,
}

/// The direction(s) a shutdown operation affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    /// Shut down sending.
    Send,
    /// Shut down receiving.
    Receive,
    /// Shut down both directions.
    Both,
}

/// The result of a shutdown transition: which announcements this call must
/// make, which half-sides must now actually be shut down, and the origin
/// that instigated the transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownContext {
    shutdown_initiated: bool,
    shutdown_send: bool,
    shutdown_receive: bool,
    shutdown_completed: bool,
    shutdown_origin: Option<ShutdownOrigin>,
}

impl ShutdownContext {
    /// True if this call should announce that shutdown began.
    #[must_use]
    pub fn shutdown_initiated(&self) -> bool {
        self.shutdown_initiated
    }

    /// True if this call should shut down the send side.
    #[must_use]
    pub fn shutdown_send(&self) -> bool {
        self.shutdown_send
    }

    /// True if this call should shut down the receive side.
    #[must_use]
    pub fn shutdown_receive(&self) -> bool {
        self.shutdown_receive
    }

    /// True if this call should announce that shutdown completed; the
    /// socket is now eligible for detach and close.
    #[must_use]
    pub fn shutdown_completed(&self) -> bool {
        self.shutdown_completed
    }

    /// The origin that instigated this transition, if one took effect.
    #[must_use]
    pub fn shutdown_origin(&self) -> Option<ShutdownOrigin> {
        self.shutdown_origin
    }
}

/// Sequences the shutdown of the two half-sides of a stream socket.
///
/// Each direction shuts down at most once and records the origin that
/// triggered it; completion is announced by exactly one call.
#[derive(Debug, Default)]
pub struct ShutdownState {
    initiated: bool,
    send_down: bool,
    receive_down: bool,
    completed: bool,
    send_origin: Option<ShutdownOrigin>,
    receive_origin: Option<ShutdownOrigin>,
}

impl ShutdownState {
    /// Create a new state with both directions open.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shut down sending, instigated by the local user of the socket.
    /// When `keep_half_open` is false, receiving is scheduled for shutdown
    /// as well. Returns false if sending was already shut down.
    pub fn try_shutdown_send(
        &mut self,
        context: &mut ShutdownContext,
        keep_half_open: bool,
    ) -> bool {
        *context = ShutdownContext::default();

        if self.send_down {
            return false;
        }

        context.shutdown_initiated = !self.initiated;
        self.initiated = true;

        self.send_down = true;
        self.send_origin = Some(ShutdownOrigin::Source);
        context.shutdown_send = true;
        context.shutdown_origin = Some(ShutdownOrigin::Source);

        if !keep_half_open && !self.receive_down {
            self.receive_down = true;
            self.receive_origin = Some(ShutdownOrigin::Source);
            context.shutdown_receive = true;
        }

        self.check_completed(context);
        true
    }

    /// Shut down receiving, recording the `origin` that instigated it:
    /// `Remote` when reading end-of-file revealed the peer's half-close,
    /// `Source` when the local user asked. When `keep_half_open` is false,
    /// sending is scheduled for shutdown as well; when true, sending
    /// continues until it is shut down separately. Returns false if
    /// receiving was already shut down.
    pub fn try_shutdown_receive(
        &mut self,
        context: &mut ShutdownContext,
        keep_half_open: bool,
        origin: ShutdownOrigin,
    ) -> bool {
        *context = ShutdownContext::default();

        if self.receive_down {
            return false;
        }

        context.shutdown_initiated = !self.initiated;
        self.initiated = true;

        self.receive_down = true;
        self.receive_origin = Some(origin);
        context.shutdown_receive = true;
        context.shutdown_origin = Some(origin);

        if !keep_half_open && !self.send_down {
            self.send_down = true;
            self.send_origin = Some(origin);
            context.shutdown_send = true;
        }

        self.check_completed(context);
        true
    }

    /// Forcibly close both directions without announcements.
    pub fn close(&mut self) {
        self.initiated = true;
        self.send_down = true;
        self.receive_down = true;
        self.completed = true;
    }

    /// Reset to the state at construction.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// True if shutdown has begun.
    #[must_use]
    pub fn initiated(&self) -> bool {
        self.initiated
    }

    /// True if the socket has not been shut down for sending.
    #[must_use]
    pub fn can_send(&self) -> bool {
        !self.send_down
    }

    /// True if the socket has not been shut down for receiving.
    #[must_use]
    pub fn can_receive(&self) -> bool {
        !self.receive_down
    }

    /// True if both directions are shut down.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.completed
    }

    /// The origin that shut down sending, once it is down.
    #[must_use]
    pub fn send_origin(&self) -> Option<ShutdownOrigin> {
        self.send_origin
    }

    /// The origin that shut down receiving, once it is down.
    #[must_use]
    pub fn receive_origin(&self) -> Option<ShutdownOrigin> {
        self.receive_origin
    }

    fn check_completed(&mut self, context: &mut ShutdownContext) {
        if self.send_down && self.receive_down && !self.completed {
            self.completed = true;
            context.shutdown_completed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_control_apply_then_relax_restores() {
        let mut state = FlowControlState::new();
        let mut context = FlowControlContext::default();

        assert!(state.relax(&mut context, FlowControlType::Both, false));
        assert!(state.want_send() && state.want_receive());

        assert!(state.apply(&mut context, FlowControlType::Send, false));
        assert!(!state.want_send());
        assert!(state.want_receive());

        assert!(state.relax(&mut context, FlowControlType::Send, false));
        assert!(state.want_send());
    }

    #[test]
    fn flow_control_lock_blocks_relax() {
        let mut state = FlowControlState::new();
        let mut context = FlowControlContext::default();

        state.relax(&mut context, FlowControlType::Both, false);
        assert!(state.apply(&mut context, FlowControlType::Receive, true));
        assert!(!state.relax(&mut context, FlowControlType::Receive, false));
        assert!(!state.want_receive());

        assert!(state.relax(&mut context, FlowControlType::Receive, true));
        assert!(state.want_receive());
    }

    #[test]
    fn flow_control_closed_is_terminal() {
        let mut state = FlowControlState::new();
        let mut context = FlowControlContext::default();

        state.relax(&mut context, FlowControlType::Both, false);
        state.close();
        assert!(!state.relax(&mut context, FlowControlType::Both, true));
        assert!(!state.want_send());
        assert!(!state.want_receive());
        assert!(state.closed());
    }

    #[test]
    fn flow_control_rearm_only_enabled_and_unlocked() {
        let mut state = FlowControlState::new();
        let mut context = FlowControlContext::default();

        state.relax(&mut context, FlowControlType::Both, false);
        state.apply(&mut context, FlowControlType::Send, false);

        assert!(!state.rearm(&mut context, FlowControlType::Send, true));
        assert!(state.rearm(&mut context, FlowControlType::Receive, true));
        assert!(!state.rearm(&mut context, FlowControlType::Receive, false));
    }

    #[test]
    fn open_state_permissions() {
        assert!(OpenState::Default.can_bind());
        assert!(OpenState::Default.can_connect());
        assert!(!OpenState::Default.can_send());
        assert!(OpenState::Connected.can_send());
        assert!(OpenState::Connected.can_receive());
        assert!(OpenState::Closed.can_receive());
        assert!(!OpenState::Closed.can_send());
        assert!(!OpenState::Waiting.can_connect());
    }

    #[test]
    fn shutdown_both_directions_completes_once() {
        let mut state = ShutdownState::new();
        let mut context = ShutdownContext::default();

        assert!(state.try_shutdown_send(&mut context, true));
        assert!(context.shutdown_initiated());
        assert!(context.shutdown_send());
        assert!(!context.shutdown_receive());
        assert!(!context.shutdown_completed());
        assert_eq!(context.shutdown_origin(), Some(ShutdownOrigin::Source));

        assert!(state.try_shutdown_receive(&mut context, true, ShutdownOrigin::Remote));
        assert!(!context.shutdown_initiated());
        assert!(context.shutdown_receive());
        assert!(context.shutdown_completed());
        assert_eq!(context.shutdown_origin(), Some(ShutdownOrigin::Remote));
        assert!(state.completed());
        assert_eq!(state.send_origin(), Some(ShutdownOrigin::Source));
        assert_eq!(state.receive_origin(), Some(ShutdownOrigin::Remote));

        assert!(!state.try_shutdown_send(&mut context, true));
        assert!(!state.try_shutdown_receive(&mut context, true, ShutdownOrigin::Source));
        assert_eq!(context.shutdown_origin(), None);
        // A refused repeat does not rewrite the recorded origins.
        assert_eq!(state.receive_origin(), Some(ShutdownOrigin::Remote));
    }

    #[test]
    fn shutdown_cascades_without_keep_half_open() {
        let mut state = ShutdownState::new();
        let mut context = ShutdownContext::default();

        assert!(state.try_shutdown_send(&mut context, false));
        assert!(context.shutdown_send());
        assert!(context.shutdown_receive());
        assert!(context.shutdown_completed());
        assert!(state.completed());
        // The cascaded direction inherits the instigating origin.
        assert_eq!(state.send_origin(), Some(ShutdownOrigin::Source));
        assert_eq!(state.receive_origin(), Some(ShutdownOrigin::Source));
    }

    #[test]
    fn shutdown_remote_half_close_keeps_send_open() {
        let mut state = ShutdownState::new();
        let mut context = ShutdownContext::default();

        assert!(state.try_shutdown_receive(&mut context, true, ShutdownOrigin::Remote));
        assert!(context.shutdown_receive());
        assert!(!context.shutdown_send());
        assert!(!context.shutdown_completed());
        assert_eq!(context.shutdown_origin(), Some(ShutdownOrigin::Remote));
        assert!(state.can_send());
        assert!(!state.can_receive());
        assert_eq!(state.receive_origin(), Some(ShutdownOrigin::Remote));
        assert_eq!(state.send_origin(), None);
    }

    #[test]
    fn shutdown_remote_cascade_records_remote_send_origin() {
        let mut state = ShutdownState::new();
        let mut context = ShutdownContext::default();

        assert!(state.try_shutdown_receive(&mut context, false, ShutdownOrigin::Remote));
        assert!(context.shutdown_send());
        assert!(context.shutdown_receive());
        assert!(context.shutdown_completed());
        assert_eq!(state.send_origin(), Some(ShutdownOrigin::Remote));
        assert_eq!(state.receive_origin(), Some(ShutdownOrigin::Remote));
    }
}
