use bytes::Bytes;
use protocol::value::{DataType, Value};
use protocol::{CreateSpec, DatumId, Error, NotifyEvent, Rank, Result, RetrieveMode, SubscribeOutcome};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Event is a deferred consequence of a store mutation, drained by the
/// progress loop once the mutating RPC has been handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Deliver a READY or CLOSED notification to a subscriber.
    Notify {
        rank: Rank,
        id: DatumId,
        subscript: Option<Bytes>,
        event: NotifyEvent,
    },
    /// The datum is gone; any cache entry for it must be dropped.
    Destroyed { id: DatumId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unset,
    Set,
}

#[derive(Debug)]
struct Subscriber {
    rank: Rank,
    subscript: Option<Bytes>,
}

#[derive(Debug)]
struct Datum {
    data_type: DataType,
    state: State,
    /// Encoded value, present once SET.
    value: Option<Bytes>,
    /// Committed container members, accumulated before close.
    members: BTreeMap<Vec<u8>, DatumId>,
    read_rc: i64,
    write_rc: i64,
    permanent: bool,
    subscribers: Vec<Subscriber>,
}

/// Store holds the data owned by one server: the ids congruent to its
/// server index modulo the server count.
pub struct Store {
    server_index: u32,
    num_servers: u32,
    next_id: DatumId,
    data: HashMap<DatumId, Datum>,
    events: VecDeque<Event>,
}

impl Store {
    pub fn new(server_index: u32, num_servers: u32) -> Store {
        assert!(server_index < num_servers);
        Store {
            server_index,
            num_servers,
            // Ids below num_servers are never allocated, so id zero and
            // the "null" range stay invalid.
            next_id: server_index as DatumId + num_servers as DatumId,
            data: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    /// The server index owning `id`.
    pub fn home_of(id: DatumId, num_servers: u32) -> u32 {
        (id.rem_euclid(num_servers as DatumId)) as u32
    }

    /// Whether this server's id sequence contains `id`.
    pub fn owns(&self, id: DatumId) -> bool {
        id >= 0 && Store::home_of(id, self.num_servers) == self.server_index
    }

    /// Drain the pending event log.
    pub fn drain_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// A fresh unused id from this server's sequence.
    pub fn unique_id(&mut self) -> DatumId {
        loop {
            let id = self.next_id;
            self.next_id += self.num_servers as DatumId;
            if !self.data.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn create(&mut self, spec: &CreateSpec) -> Result<DatumId> {
        let id = match spec.hint {
            Some(hint) => {
                if !self.owns(hint) {
                    return Err(Error::Invalid(format!(
                        "id hint <{hint}> does not map to this server"
                    )));
                }
                if self.data.contains_key(&hint) {
                    return Err(Error::Invalid(format!("id <{hint}> already exists")));
                }
                hint
            }
            None => self.unique_id(),
        };
        if spec.read_rc < 0 || spec.write_rc < 0 {
            return Err(Error::Invalid("negative initial refcount".to_owned()));
        }
        self.data.insert(
            id,
            Datum {
                data_type: spec.data_type,
                state: State::Unset,
                value: None,
                members: BTreeMap::new(),
                read_rc: spec.read_rc,
                write_rc: spec.write_rc,
                permanent: spec.permanent,
                subscribers: Vec::new(),
            },
        );
        tracing::debug!(id, data_type = ?spec.data_type, "created datum");
        Ok(id)
    }

    /// Allocate a batch of datums in one call.
    pub fn multi_create(&mut self, specs: &[CreateSpec]) -> Result<Vec<DatumId>> {
        for spec in specs {
            if let Some(hint) = spec.hint {
                if !self.owns(hint) || self.data.contains_key(&hint) {
                    return Err(Error::Invalid(format!("bad id hint <{hint}>")));
                }
            }
        }
        specs.iter().map(|spec| self.create(spec)).collect()
    }

    /// Commit a value (or, with a subscript, a container member), then
    /// apply `write_decrement` and fire the resulting notifications.
    pub fn store(
        &mut self,
        id: DatumId,
        data_type: DataType,
        subscript: Option<Bytes>,
        bytes: Bytes,
        write_decrement: i64,
    ) -> Result<()> {
        match subscript {
            None => self.store_value(id, data_type, bytes, write_decrement),
            Some(subscript) => self.store_member(id, data_type, subscript, bytes, write_decrement),
        }
    }

    fn store_value(
        &mut self,
        id: DatumId,
        data_type: DataType,
        bytes: Bytes,
        write_decrement: i64,
    ) -> Result<()> {
        let datum = self.data.get_mut(&id).ok_or(Error::NotFound(id))?;
        if datum.state == State::Set {
            return Err(Error::DoubleWrite(id));
        }
        if data_type != datum.data_type {
            return Err(Error::WrongType {
                id,
                requested: data_type,
                actual: datum.data_type,
            });
        }
        // Validate the encoding before committing.
        let value = Value::decode(data_type, &bytes)?;

        datum.state = State::Set;
        datum.value = Some(bytes);
        if let Value::Container(members) = value {
            datum.members = members;
        }
        tracing::debug!(id, ?data_type, "datum set");

        self.notify_on_set(id);
        self.apply_write_delta(id, -write_decrement);
        self.maybe_destroy(id);
        Ok(())
    }

    fn store_member(
        &mut self,
        id: DatumId,
        data_type: DataType,
        subscript: Bytes,
        bytes: Bytes,
        write_decrement: i64,
    ) -> Result<()> {
        let datum = self.data.get_mut(&id).ok_or(Error::NotFound(id))?;
        if datum.data_type != DataType::Container {
            return Err(Error::WrongType {
                id,
                requested: DataType::Container,
                actual: datum.data_type,
            });
        }
        if data_type != DataType::Ref {
            return Err(Error::Invalid(
                "container members are stored as Ref".to_owned(),
            ));
        }
        if datum.state == State::Set {
            // The container is closed; no further inserts.
            return Err(Error::DoubleWrite(id));
        }
        let member = match Value::decode(DataType::Ref, &bytes)? {
            Value::Ref(member) => member,
            _ => unreachable!("Ref decodes to Ref"),
        };
        if datum
            .members
            .insert(subscript.to_vec(), member)
            .is_some()
        {
            return Err(Error::DoubleWrite(id));
        }
        tracing::debug!(id, member, "container insert committed");

        // Wake subscribers parked on exactly this subscript.
        let mut kept = Vec::new();
        for sub in datum.subscribers.drain(..) {
            if sub.subscript.as_deref() == Some(subscript.as_ref()) {
                self.events.push_back(Event::Notify {
                    rank: sub.rank,
                    id,
                    subscript: Some(subscript.clone()),
                    event: NotifyEvent::Ready,
                });
            } else {
                kept.push(sub);
            }
        }
        self.data.get_mut(&id).unwrap().subscribers = kept;

        self.apply_write_delta(id, -write_decrement);
        self.maybe_destroy(id);
        Ok(())
    }

    /// Copy out a value, or a container member id under a subscript.
    pub fn retrieve(
        &mut self,
        id: DatumId,
        subscript: Option<&[u8]>,
        mode: RetrieveMode,
    ) -> Result<(DataType, Bytes)> {
        let datum = self.data.get(&id).ok_or(Error::NotFound(id))?;
        let out = match subscript {
            None => {
                if datum.state != State::Set {
                    return Err(Error::Unset(id));
                }
                (datum.data_type, datum.value.clone().expect("set datum has a value"))
            }
            Some(subscript) => {
                if datum.data_type != DataType::Container {
                    return Err(Error::WrongType {
                        id,
                        requested: DataType::Container,
                        actual: datum.data_type,
                    });
                }
                match datum.members.get(subscript) {
                    Some(&member) => (DataType::Ref, Value::Ref(member).encode()),
                    None if datum.state == State::Set => return Err(Error::NotFound(id)),
                    None => return Err(Error::Unset(id)),
                }
            }
        };
        if mode == RetrieveMode::ReadRc {
            self.apply_read_delta(id, -1);
            self.maybe_destroy(id);
        }
        Ok(out)
    }

    pub fn exists(&self, id: DatumId, subscript: Option<&[u8]>) -> bool {
        let Some(datum) = self.data.get(&id) else {
            return false;
        };
        match subscript {
            None => datum.state == State::Set,
            Some(subscript) => datum.members.contains_key(subscript),
        }
    }

    pub fn subscribe(
        &mut self,
        id: DatumId,
        subscript: Option<Bytes>,
        rank: Rank,
    ) -> Result<SubscribeOutcome> {
        let datum = self.data.get_mut(&id).ok_or(Error::NotFound(id))?;
        match &subscript {
            None => {
                if datum.state == State::Set {
                    return Ok(SubscribeOutcome::AlreadyReady);
                }
            }
            Some(subscript) => {
                if datum.data_type != DataType::Container {
                    return Err(Error::WrongType {
                        id,
                        requested: DataType::Container,
                        actual: datum.data_type,
                    });
                }
                if datum.members.contains_key(subscript.as_ref()) {
                    return Ok(SubscribeOutcome::AlreadyReady);
                }
                if datum.state == State::Set {
                    // Closed without this subscript: it can never appear.
                    return Err(Error::Closed(id));
                }
            }
        }
        datum.subscribers.push(Subscriber { rank, subscript });
        Ok(SubscribeOutcome::Pending)
    }

    /// Apply explicit refcount deltas. Write refcounts may only grow while
    /// the datum is UNSET.
    pub fn refcount_incr(&mut self, id: DatumId, read_delta: i64, write_delta: i64) -> Result<()> {
        let datum = self.data.get_mut(&id).ok_or(Error::NotFound(id))?;
        if datum.permanent {
            return Ok(());
        }
        if write_delta > 0 && datum.state == State::Set {
            return Err(Error::Invalid(format!(
                "write refcount of set datum <{id}> cannot grow"
            )));
        }
        self.apply_read_delta(id, read_delta);
        self.apply_write_delta(id, write_delta);
        self.maybe_destroy(id);
        Ok(())
    }

    fn apply_read_delta(&mut self, id: DatumId, delta: i64) {
        let datum = self.data.get_mut(&id).expect("datum exists");
        if datum.permanent {
            return;
        }
        datum.read_rc += delta;
        assert!(
            datum.read_rc >= 0,
            "read refcount of <{id}> went negative"
        );
    }

    fn apply_write_delta(&mut self, id: DatumId, delta: i64) {
        let datum = self.data.get_mut(&id).expect("datum exists");
        if datum.permanent || delta == 0 {
            return;
        }
        let was = datum.write_rc;
        datum.write_rc += delta;
        assert!(
            datum.write_rc >= 0,
            "write refcount of <{id}> went negative"
        );
        if datum.write_rc == 0 && was > 0 && datum.state == State::Unset {
            self.write_rc_exhausted(id);
        }
    }

    /// The last writer is gone while the datum is UNSET. A container
    /// closes with the members committed so far; anything else can never
    /// be set and is destroyed, CLOSED notifications to its subscribers.
    fn write_rc_exhausted(&mut self, id: DatumId) {
        let datum = self.data.get_mut(&id).expect("datum exists");
        if datum.data_type == DataType::Container {
            datum.state = State::Set;
            datum.value = Some(Value::Container(datum.members.clone()).encode());
            tracing::debug!(id, members = datum.members.len(), "container closed");
            self.notify_on_set(id);
        } else {
            tracing::debug!(id, "datum closed while unset");
            self.destroy(id, NotifyEvent::Closed);
        }
    }

    /// Fire READY for waiting subscribers whose condition now holds.
    /// Subscript subscribers whose subscript never appeared get CLOSED:
    /// a SET datum admits no further inserts.
    fn notify_on_set(&mut self, id: DatumId) {
        let datum = self.data.get_mut(&id).expect("datum exists");
        let subscribers = std::mem::take(&mut datum.subscribers);
        let members = &datum.members;
        let mut queued = Vec::new();
        for sub in subscribers {
            let event = match &sub.subscript {
                None => NotifyEvent::Ready,
                Some(subscript) if members.contains_key(subscript.as_ref()) => NotifyEvent::Ready,
                Some(_) => NotifyEvent::Closed,
            };
            queued.push(Event::Notify {
                rank: sub.rank,
                id,
                subscript: sub.subscript,
                event,
            });
        }
        self.events.extend(queued);
    }

    fn maybe_destroy(&mut self, id: DatumId) {
        let Some(datum) = self.data.get(&id) else {
            return;
        };
        if datum.permanent || datum.read_rc > 0 || datum.write_rc > 0 {
            return;
        }
        if datum.state == State::Unset {
            // write_rc_exhausted already handled the unset path.
            return;
        }
        self.destroy(id, NotifyEvent::Closed);
    }

    fn destroy(&mut self, id: DatumId, event: NotifyEvent) {
        let datum = self.data.remove(&id).expect("datum exists");
        for sub in datum.subscribers {
            self.events.push_back(Event::Notify {
                rank: sub.rank,
                id,
                subscript: sub.subscript,
                event,
            });
        }
        self.events.push_back(Event::Destroyed { id });
        tracing::debug!(id, "datum destroyed");
    }
}
