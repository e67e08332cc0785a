use rand::RngCore;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A fixed-size, pre-generated random buffer consumed by slicing with
/// wraparound. Generated once at startup and read-only thereafter — lock-free
/// (spec §3 "Circular payload", §9 "random payload buffer").
#[derive(Clone)]
pub struct PayloadBuffer {
    data: Arc<Vec<u8>>,
}

impl PayloadBuffer {
    pub fn generate(size: usize) -> Self {
        let mut buf = vec![0u8; size];
        rand::rng().fill_bytes(&mut buf);
        Self { data: Arc::new(buf) }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `want` bytes starting at `offset % len`, copied into `out`
    /// (truncated to `out.len()`), handling the wraparound split. Returns
    /// the number of bytes written and the next offset.
    pub fn fill_slice(&self, offset: usize, out: &mut [u8]) -> usize {
        let len = self.data.len();
        if len == 0 || out.is_empty() {
            return 0;
        }
        let want = out.len();
        let start = offset % len;
        if start + want <= len {
            out.copy_from_slice(&self.data[start..start + want]);
        } else {
            let first = len - start;
            out[..first].copy_from_slice(&self.data[start..len]);
            let mut remaining = want - first;
            let mut dst = first;
            let mut src = 0usize;
            while remaining > 0 {
                let chunk = remaining.min(len);
                out[dst..dst + chunk].copy_from_slice(&self.data[src..src + chunk]);
                dst += chunk;
                src = (src + chunk) % len;
                remaining -= chunk;
            }
        }
        want
    }
}

/// An object pool for fixed-size receive buffers. Buffers are validated on
/// retrieval — a wrong-sized buffer (possible if the pool type is reused
/// across call sites with differing sizes) is replaced rather than reused
/// (spec §9 "task-private buffers").
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize, prealloc: usize) -> Self {
        let free = (0..prealloc).map(|_| vec![0u8; size]).collect();
        Self {
            size,
            free: Mutex::new(free),
        }
    }

    pub async fn acquire(&self) -> Vec<u8> {
        let mut free = self.free.lock().await;
        match free.pop() {
            Some(buf) if buf.len() == self.size => buf,
            _ => vec![0u8; self.size],
        }
    }

    pub async fn release(&self, buf: Vec<u8>) {
        if buf.len() != self.size {
            return;
        }
        let mut free = self.free.lock().await;
        // Bound the pool so a burst of connections doesn't grow it forever.
        if free.len() < 256 {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_slice_wraps_around() {
        let payload = PayloadBuffer {
            data: Arc::new((0u8..10).collect()),
        };
        let mut out = [0u8; 6];
        payload.fill_slice(7, &mut out);
        assert_eq!(out, [7, 8, 9, 0, 1, 2]);
    }

    #[test]
    fn fill_slice_no_wrap() {
        let payload = PayloadBuffer {
            data: Arc::new((0u8..10).collect()),
        };
        let mut out = [0u8; 3];
        payload.fill_slice(2, &mut out);
        assert_eq!(out, [2, 3, 4]);
    }

    #[tokio::test]
    async fn pool_replaces_wrong_sized_buffer() {
        let pool = BufferPool::new(8, 1);
        let wrong = vec![0u8; 4];
        pool.release(wrong).await;
        // release() rejects the wrong size, so the pool still holds its
        // correctly-sized preallocated buffer.
        let got = pool.acquire().await;
        assert_eq!(got.len(), 8);
    }
}
