// Client-side room link: connection state machine with a single bounded retry.
//
// The link never performs IO. Callers feed it `LinkEvent`s and execute the
// returned `LinkAction`s against their transport and timer. Transport
// liveness and the desired focus are tracked independently so that moving
// to a section never looks like a lost connection.

use std::time::Duration;

use uuid::Uuid;

use crate::protocol::ws::{ClientFrame, CURRENT_PROTOCOL_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the user is looking at inside the club.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Focus {
    Room(Uuid),
    Section(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Close frame exchanged or explicit logout.
    Graceful,
    /// Transport dropped without a close handshake.
    Abnormal,
}

/// Reconnection parameters. One fixed delay, bounded attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { retry_delay: Duration::from_secs(3), max_attempts: 1 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Start,
    TransportOpened,
    HelloAcked,
    TransportClosed(CloseKind),
    RetryTimerFired,
    NavigateToRoom(Uuid),
    NavigateToSection(String),
    Logout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    OpenTransport,
    Send(ClientFrame),
    ScheduleRetry(Duration),
    CloseTransport,
    /// The retry budget is spent; surface the disconnect to the user.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RoomLink {
    club_id: Uuid,
    token: String,
    policy: ReconnectPolicy,
    state: LinkState,
    transport_alive: bool,
    desired: Option<Focus>,
    /// Whether a room has been joined on the current transport.
    joined_room: bool,
    failed_attempts: u32,
}

impl RoomLink {
    pub fn new(club_id: Uuid, token: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            club_id,
            token: token.into(),
            policy,
            state: LinkState::Disconnected,
            transport_alive: false,
            desired: None,
            joined_room: false,
            failed_attempts: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn transport_alive(&self) -> bool {
        self.transport_alive
    }

    pub fn desired_focus(&self) -> Option<&Focus> {
        self.desired.as_ref()
    }

    /// The transport is kept open exactly while the user wants to be inside
    /// the club, whatever room or section that is.
    pub fn wants_transport(&self) -> bool {
        self.desired.is_some()
    }

    pub fn handle(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        match event {
            LinkEvent::Start => self.connect(),
            LinkEvent::TransportOpened => {
                if self.state != LinkState::Connecting {
                    return Vec::new();
                }
                self.transport_alive = true;
                vec![LinkAction::Send(ClientFrame::Hello {
                    token: self.token.clone(),
                    protocol_version: Some(CURRENT_PROTOCOL_VERSION.to_string()),
                })]
            }
            LinkEvent::HelloAcked => {
                self.state = LinkState::Connected;
                self.failed_attempts = 0;
                self.joined_room = false;
                self.focus_frame().map(LinkAction::Send).into_iter().collect()
            }
            LinkEvent::TransportClosed(kind) => self.on_closed(kind),
            LinkEvent::RetryTimerFired => {
                if self.state == LinkState::Connecting && !self.transport_alive {
                    vec![LinkAction::OpenTransport]
                } else {
                    Vec::new()
                }
            }
            LinkEvent::NavigateToRoom(room_id) => {
                self.desired = Some(Focus::Room(room_id));
                self.after_navigation()
            }
            LinkEvent::NavigateToSection(section) => {
                self.desired = Some(Focus::Section(section));
                self.after_navigation()
            }
            LinkEvent::Logout => {
                self.desired = None;
                self.state = LinkState::Disconnected;
                self.joined_room = false;
                if !self.transport_alive {
                    return Vec::new();
                }
                self.transport_alive = false;
                vec![LinkAction::Send(ClientFrame::Leave), LinkAction::CloseTransport]
            }
        }
    }

    fn connect(&mut self) -> Vec<LinkAction> {
        if self.state != LinkState::Disconnected {
            return Vec::new();
        }
        self.state = LinkState::Connecting;
        self.failed_attempts = 0;
        vec![LinkAction::OpenTransport]
    }

    fn after_navigation(&mut self) -> Vec<LinkAction> {
        match self.state {
            LinkState::Disconnected => self.connect(),
            // Focus is applied once the handshake completes.
            LinkState::Connecting => Vec::new(),
            LinkState::Connected => self.focus_frame().map(LinkAction::Send).into_iter().collect(),
        }
    }

    fn focus_frame(&mut self) -> Option<ClientFrame> {
        match self.desired.clone()? {
            Focus::Room(room_id) if self.joined_room => Some(ClientFrame::SwitchRoom { room_id }),
            Focus::Room(room_id) => {
                self.joined_room = true;
                Some(ClientFrame::Join { club_id: self.club_id, room_id })
            }
            Focus::Section(section) => {
                Some(ClientFrame::ViewSection { section, club_id: Some(self.club_id) })
            }
        }
    }

    fn on_closed(&mut self, kind: CloseKind) -> Vec<LinkAction> {
        self.transport_alive = false;
        self.joined_room = false;

        if kind == CloseKind::Graceful || self.desired.is_none() {
            self.state = LinkState::Disconnected;
            return Vec::new();
        }

        if self.failed_attempts >= self.policy.max_attempts {
            self.state = LinkState::Disconnected;
            return vec![LinkAction::GiveUp];
        }

        self.failed_attempts += 1;
        self.state = LinkState::Connecting;
        vec![LinkAction::ScheduleRetry(self.policy.retry_delay)]
    }
}
