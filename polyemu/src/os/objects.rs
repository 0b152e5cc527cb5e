use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    net::{TcpListener, TcpStream},
    path::PathBuf,
};

/// A host-backed resource the guest sees through a descriptor or handle.
///
/// Objects are plain data so the table can be checkpointed; file I/O is
/// positional against `offset`, sockets keep their host half in [`HostHandles`].
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmulatedObject {
    Stdio {
        stream: u8,
    },
    File {
        guest_path: String,
        host_path: PathBuf,
        offset: u64,
        readable: bool,
        writable: bool,
        append: bool,
        directory: bool,
    },
    Pipe {
        id: u64,
        write_end: bool,
    },
    Socket {
        id: u64,
        domain: u64,
        kind: u64,
    },
    Thread {
        tid: u64,
    },
    Event {
        manual_reset: bool,
        signaled: bool,
    },
    RegistryKey {
        path: String,
    },
}

impl EmulatedObject {
    fn pipe_id(&self) -> Option<u64> {
        match self {
            EmulatedObject::Pipe { id, .. } => Some(*id),
            _ => None,
        }
    }
    fn socket_id(&self) -> Option<u64> {
        match self {
            EmulatedObject::Socket { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Descriptor table of the emulated process. New handles take the lowest free
/// number at or above `min_handle`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Eq, PartialEq)]
pub struct ObjectTable {
    objects: BTreeMap<u64, EmulatedObject>,
    min_handle: u64,
    pipes: BTreeMap<u64, VecDeque<u8>>,
    next_id: u64,
}

impl ObjectTable {
    pub fn new(min_handle: u64) -> Self {
        Self {
            objects: BTreeMap::new(),
            min_handle,
            pipes: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Standard streams at `first`, `first + 1`, `first + 2`.
    pub fn with_stdio(min_handle: u64, first: u64) -> Self {
        let mut table = Self::new(min_handle);
        for stream in 0..3u8 {
            table.insert_at(first + stream as u64, EmulatedObject::Stdio { stream });
        }
        table
    }

    fn lowest_free(&self, from: u64) -> u64 {
        let mut h = from.max(self.min_handle);
        while self.objects.contains_key(&h) {
            h += 1;
        }
        h
    }

    pub fn insert(&mut self, object: EmulatedObject) -> u64 {
        let h = self.lowest_free(0);
        self.objects.insert(h, object);
        h
    }

    /// Lowest free handle at or above `from` (F_DUPFD).
    pub fn insert_from(&mut self, from: u64, object: EmulatedObject) -> u64 {
        let h = self.lowest_free(from);
        self.objects.insert(h, object);
        h
    }

    /// Install at a fixed handle, closing whatever was there.
    pub fn insert_at(&mut self, handle: u64, object: EmulatedObject) -> Option<EmulatedObject> {
        let old = self.objects.insert(handle, object);
        if let Some(old) = &old {
            self.release(old);
        }
        old
    }

    pub fn get(&self, handle: u64) -> Option<&EmulatedObject> {
        self.objects.get(&handle)
    }

    pub fn get_mut(&mut self, handle: u64) -> Option<&mut EmulatedObject> {
        self.objects.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: u64) -> Option<EmulatedObject> {
        let old = self.objects.remove(&handle)?;
        self.release(&old);
        Some(old)
    }

    /// Drop shared state no descriptor refers to any more.
    fn release(&mut self, old: &EmulatedObject) {
        if let Some(id) = old.pipe_id() {
            if !self.objects.values().any(|o| o.pipe_id() == Some(id)) {
                self.pipes.remove(&id);
            }
        }
    }

    pub fn socket_in_use(&self, id: u64) -> bool {
        self.objects.values().any(|o| o.socket_id() == Some(id))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = (&u64, &EmulatedObject)> {
        self.objects.iter()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.pipes.clear();
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Create both ends of a pipe; returns (read, write) handles.
    pub fn new_pipe(&mut self) -> (u64, u64) {
        let id = self.next_id();
        self.pipes.insert(id, VecDeque::new());
        let r = self.insert(EmulatedObject::Pipe {
            id,
            write_end: false,
        });
        let w = self.insert(EmulatedObject::Pipe { id, write_end: true });
        (r, w)
    }

    pub fn pipe_buffer(&mut self, id: u64) -> Option<&mut VecDeque<u8>> {
        self.pipes.get_mut(&id)
    }

    pub fn pipe_has_writer(&self, id: u64) -> bool {
        self.objects
            .values()
            .any(|o| matches!(o, EmulatedObject::Pipe { id: i, write_end: true } if *i == id))
    }

    /// A reader of pipe `id` would not block.
    pub fn pipe_ready(&self, id: u64) -> bool {
        self.pipes.get(&id).map(|b| !b.is_empty()).unwrap_or(true) || !self.pipe_has_writer(id)
    }
}

/// Host resources that cannot be checkpointed. Dropping this closes them.
#[derive(Debug, Default)]
pub struct HostHandles {
    pub listeners: BTreeMap<u64, TcpListener>,
    pub streams: BTreeMap<u64, TcpStream>,
    /// sockets bound but not yet listening
    pub bound: BTreeMap<u64, String>,
}

impl HostHandles {
    pub fn close(&mut self, id: u64) {
        self.listeners.remove(&id);
        self.streams.remove(&id);
        self.bound.remove(&id);
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
        self.streams.clear();
        self.bound.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty() && self.streams.is_empty() && self.bound.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::{EmulatedObject, ObjectTable};

    #[test]
    fn test_lowest_free_handle() {
        let mut table = ObjectTable::with_stdio(0, 0);
        let a = table.insert(EmulatedObject::Thread { tid: 1 });
        let b = table.insert(EmulatedObject::Thread { tid: 2 });
        assert_eq!((a, b), (3, 4));
        table.remove(0);
        assert_eq!(table.insert(EmulatedObject::Thread { tid: 3 }), 0);
        assert_eq!(table.insert_from(10, EmulatedObject::Thread { tid: 4 }), 10);
    }

    #[test]
    fn test_pipe_lifetime() {
        let mut table = ObjectTable::new(0);
        let (r, w) = table.new_pipe();
        table.pipe_buffer(1).unwrap().extend(b"hi");
        assert!(table.pipe_ready(1));
        table.pipe_buffer(1).unwrap().clear();
        assert!(!table.pipe_ready(1));
        table.remove(w);
        // no writer left: reads see eof
        assert!(table.pipe_ready(1));
        table.remove(r);
        assert!(table.pipe_buffer(1).is_none());
        assert!(table.is_empty());
    }
}
