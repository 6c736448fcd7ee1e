use std::sync::Mutex;
use tracing::{debug, trace};
use crate::buffers::fixed_buf::FixedBuf;

/// A pool of uniformly sized scratch buffers for the endpoint's receive loop and outbound
///  serialisation. Buffers are handed out on demand and returned after use; the pool
///  creates new buffers when empty and discards returns beyond its configured size.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<FixedBuf>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(&self) -> FixedBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        FixedBuf::new(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: FixedBuf) {
        assert_eq!(buffer.capacity(), self.buf_size,
                   "returned buffer does not have the regular capacity of {} bytes, maybe a packet exceeding the configured packet size was sent",
                   self.buf_size);

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}
