//! Handles for the client requests the routing core shuffles around.
//!
//! Requests are produced and consumed by the external request layer; the core
//! only reads routing-relevant fields and rewrites them when requests are
//! parked for reprocessing. Everything here is single-worker shared state,
//! so handles are `Rc<RefCell<..>>` wrappers.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::cluster::NodeRef;

/// Sentinel for a request whose slot has not been resolved yet.
pub const SLOT_UNASSIGNED: i32 = -1;

pub struct ClientState {
    pub id: u64,
    /// Requests of this client currently parked for reprocessing.
    pub requests_to_reprocess: Vec<Request>,
}

/// Shared handle to a client connection as seen by the routing core.
#[derive(Clone)]
pub struct Client {
    inner: Rc<RefCell<ClientState>>,
}

impl Client {
    pub fn new(id: u64) -> Client {
        Client {
            inner: Rc::new(RefCell::new(ClientState {
                id,
                requests_to_reprocess: Vec::new(),
            })),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn borrow(&self) -> Ref<'_, ClientState> {
        self.inner.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, ClientState> {
        self.inner.borrow_mut()
    }
}

pub struct RequestState {
    pub client: Client,
    pub id: u64,
    /// Routing key; empty for keyless commands, which the core never parks.
    pub key: Bytes,
    pub slot: i32,
    /// Target node, rebound by the request layer and invalidated on
    /// reconfiguration.
    pub node: Option<NodeRef>,
    /// Bytes of this request already written to the node socket.
    pub written: usize,
    /// Set while the event loop has a write handler mid-flight for this
    /// request; such a request must not be relocated.
    pub has_write_handler: bool,
    pub need_reprocessing: bool,
    pub parent: Option<WeakRequest>,
    pub children: Vec<Request>,
}

/// Shared handle to a client request.
#[derive(Clone)]
pub struct Request {
    inner: Rc<RefCell<RequestState>>,
}

impl Request {
    pub fn new(client: &Client, id: u64, key: impl Into<Bytes>) -> Request {
        Request {
            inner: Rc::new(RefCell::new(RequestState {
                client: client.clone(),
                id,
                key: key.into(),
                slot: SLOT_UNASSIGNED,
                node: None,
                written: 0,
                has_write_handler: false,
                need_reprocessing: false,
                parent: None,
                children: Vec::new(),
            })),
        }
    }

    pub fn borrow(&self) -> Ref<'_, RequestState> {
        self.inner.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, RequestState> {
        self.inner.borrow_mut()
    }

    pub fn downgrade(&self) -> WeakRequest {
        WeakRequest {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(a: &Request, b: &Request) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// Index key in the reprocess queue: the decimal `"<client>:<request>"`
    /// pair, ordered lexicographically.
    pub fn reprocess_key(&self) -> String {
        let state = self.inner.borrow();
        format!("{}:{}", state.client.id(), state.id)
    }

    /// Attach `child` to `parent` for multi-key fan-out. The child keeps a
    /// weak back-pointer so the fan-out graph stays acyclic.
    pub fn link_child(parent: &Request, child: &Request) {
        child.borrow_mut().parent = Some(parent.downgrade());
        parent.borrow_mut().children.push(child.clone());
    }
}

#[derive(Clone)]
pub struct WeakRequest {
    inner: Weak<RefCell<RequestState>>,
}

impl WeakRequest {
    pub fn upgrade(&self) -> Option<Request> {
        self.inner.upgrade().map(|inner| Request { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reprocess_key_is_client_colon_request() {
        let client = Client::new(7);
        let req = Request::new(&client, 42, Bytes::from_static(b"foo"));
        assert_eq!(req.reprocess_key(), "7:42");
    }

    #[test]
    fn link_child_wires_both_directions() {
        let client = Client::new(1);
        let parent = Request::new(&client, 1, Bytes::from_static(b"k"));
        let child = Request::new(&client, 2, Bytes::from_static(b"k"));
        Request::link_child(&parent, &child);

        assert_eq!(parent.borrow().children.len(), 1);
        let up = child.borrow().parent.clone().unwrap().upgrade().unwrap();
        assert!(Request::ptr_eq(&up, &parent));
    }

    #[test]
    fn parent_link_does_not_keep_parent_alive() {
        let client = Client::new(1);
        let child = Request::new(&client, 2, Bytes::from_static(b"k"));
        {
            let parent = Request::new(&client, 1, Bytes::from_static(b"k"));
            child.borrow_mut().parent = Some(parent.downgrade());
        }
        assert!(child.borrow().parent.clone().unwrap().upgrade().is_none());
    }
}
