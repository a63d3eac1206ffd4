use std::cmp::Ordering;

/// The unit of work between the DB producer and the worker pool.
#[derive(Clone, Debug)]
pub struct RequestPacket {
    /// Lower value = released from the queue first.
    pub priority: i32,
    /// DB row identity; the correlation key for the whole round trip.
    pub request_id: i32,
    /// Fully-formed SOAP envelope, ready to POST.
    pub body: String,
    /// How many times the upstream's rate limiter has bounced this packet.
    pub dos_counter: u32,
}

impl RequestPacket {
    /// `queue_in` releases by ascending priority; `request_id` makes the
    /// order total when priorities collide.
    fn sort_key(&self) -> (i32, i32) {
        (self.priority, self.request_id)
    }
}

impl PartialEq for RequestPacket {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for RequestPacket {}

impl PartialOrd for RequestPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RequestPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// The unit of work between the worker pool and the DB consumer.
#[derive(Clone, Debug)]
pub struct ResponsePacket {
    pub request_id: i32,
    /// Pre-decoded error flag; set when the request never reached the
    /// upstream (builder rejection, unknown type).
    pub is_error: bool,
    /// Raw HTTP response body, or the error text when `is_error`.
    pub body: Vec<u8>,
    /// Present iff `body` came back from the upstream. The consumer uses it
    /// to republish the request and to bump `dos_counter`.
    pub origin: Option<RequestPacket>,
}

impl ResponsePacket {
    /// A producer-side failure: the row is answered without ever reaching
    /// the upstream, so it is not retried.
    pub fn error(request_id: i32, message: String) -> Self {
        Self {
            request_id,
            is_error: true,
            body: message.into_bytes(),
            origin: None,
        }
    }

    /// A raw upstream reply.
    pub fn from_upstream(origin: RequestPacket, body: Vec<u8>) -> Self {
        Self {
            request_id: origin.request_id,
            is_error: false,
            body,
            origin: Some(origin),
        }
    }
}
