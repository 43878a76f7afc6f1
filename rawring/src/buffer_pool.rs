/// `count` fixed-size buffers carved out of one allocation made up front.
///
/// Buffer addresses are stable for the pool's lifetime, which is what lets
/// them be handed to the kernel while an operation is in flight.
#[derive(Debug)]
pub struct BufferPool {
    storage: Box<[u8]>,
    buf_size: usize,
    count: usize,
}

impl BufferPool {
    pub fn new(count: usize, buf_size: usize) -> Self {
        Self {
            storage: vec![0u8; count * buf_size].into_boxed_slice(),
            buf_size,
            count,
        }
    }

    fn range(&self, index: usize) -> Option<std::ops::Range<usize>> {
        (index < self.count).then(|| index * self.buf_size..(index + 1) * self.buf_size)
    }

    pub fn buffer(&self, index: usize) -> Option<&[u8]> {
        self.range(index).map(|r| &self.storage[r])
    }

    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.range(index).map(move |r| &mut self.storage[r])
    }

    /// Address of buffer `index` for a kernel write-out (send).
    pub fn as_ptr(&self, index: usize) -> Option<*const u8> {
        self.buffer(index).map(<[u8]>::as_ptr)
    }

    /// Address of buffer `index` for a kernel fill (recv).
    pub fn as_mut_ptr(&mut self, index: usize) -> Option<*mut u8> {
        self.buffer_mut(index).map(<[u8]>::as_mut_ptr)
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
