use crate::cluster::Member;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub enum RoleSnapshot {
    Leader,
    Candidate,
    Follower(Member),
    FollowerNoLeader,
}

pub(super) fn new(initial_state: RoleSnapshot) -> (RoleChangeNotifier, RoleChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (RoleChangeNotifier { snd }, RoleChangeListener { rcv })
}

pub(super) struct RoleChangeNotifier {
    snd: watch::Sender<RoleSnapshot>,
}

impl RoleChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: RoleSnapshot) {
        let _ = self.snd.send(new_state);
    }
}

/// RoleChangeListener lets the embedding layer observe leadership changes, e.g. to
/// start/stop services that must only run on the leader.
#[derive(Clone)]
pub struct RoleChangeListener {
    rcv: watch::Receiver<RoleSnapshot>,
}

impl RoleChangeListener {
    pub async fn next(&mut self) -> Option<RoleSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }
}
