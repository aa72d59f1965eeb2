//! 字节环形缓冲区
//!
//! 生产者（播放线程）和消费者（硬件 render 回调）之间的数据桥：
//! - 一把互斥锁 + 两个条件变量（not_empty / not_full）
//! - 生产者可以阻塞：空间不足时写入能放下的部分，然后等待
//! - 消费者绝不等待：有多少读多少，临界区只做一次 O(n) 拷贝
//! - 零分配：所有内存在创建时预分配，可选 mlock 防止 page fault
//!
//! 内部偏移量不对外暴露

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// 受锁保护的环形状态
struct RingState {
    data: Box<[u8]>,
    read_pos: usize,
    available: usize,
}

impl RingState {
    /// 写入能放下的部分（最多两段拷贝），返回写入字节数
    fn push(&mut self, src: &[u8]) -> usize {
        let capacity = self.data.len();
        let count = src.len().min(capacity - self.available);
        if count == 0 {
            return 0;
        }

        let write_pos = (self.read_pos + self.available) % capacity;
        let first = count.min(capacity - write_pos);
        self.data[write_pos..write_pos + first].copy_from_slice(&src[..first]);
        self.data[..count - first].copy_from_slice(&src[first..count]);

        self.available += count;
        count
    }

    /// 读出最多 `dst.len()` 字节（最多两段拷贝），返回读出字节数
    fn pop(&mut self, dst: &mut [u8]) -> usize {
        let capacity = self.data.len();
        let count = dst.len().min(self.available);
        if count == 0 {
            return 0;
        }

        let first = count.min(capacity - self.read_pos);
        dst[..first].copy_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        dst[first..count].copy_from_slice(&self.data[..count - first]);

        self.read_pos = (self.read_pos + count) % capacity;
        self.available -= count;
        count
    }
}

/// 有界字节环形缓冲区
pub struct RingBuffer {
    state: Mutex<RingState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,

    // mlock 用：Box 内容地址在生命周期内不变
    data_addr: usize,
    memory_locked: AtomicBool,
}

impl RingBuffer {
    /// 创建指定容量（字节）的缓冲区
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");

        let data = vec![0u8; capacity].into_boxed_slice();
        let data_addr = data.as_ptr() as usize;

        Self {
            state: Mutex::new(RingState {
                data,
                read_pos: 0,
                available: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            data_addr,
            memory_locked: AtomicBool::new(false),
        }
    }

    /// 获取锁；锁中毒时继续使用内部状态，render 回调不能 panic
    #[inline]
    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 写入全部字节（生产者调用）
    ///
    /// 空间不足时写入能放下的部分，然后在 not_full 上等待，直到全部入队。
    /// 大于容量的写入会被拆成多轮，永不拒绝。
    pub fn write(&self, src: &[u8]) {
        let mut state = self.lock();
        let mut offset = 0;

        while offset < src.len() {
            while state.available == self.capacity {
                state = self
                    .not_full
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }

            offset += state.push(&src[offset..]);
            self.not_empty.notify_all();
        }
    }

    /// 非阻塞写入，返回实际写入的字节数
    pub fn try_write(&self, src: &[u8]) -> usize {
        if src.is_empty() {
            return 0;
        }

        let mut state = self.lock();
        let written = state.push(src);
        if written > 0 {
            self.not_empty.notify_all();
        }
        written
    }

    /// 读取最多 `dst.len()` 字节（消费者调用）
    ///
    /// 绝不等待生产者：没有数据时立即返回 0，调用方负责填充静音。
    /// 锁持有时间只与本次拷贝量有关，与容量无关。
    #[inline]
    pub fn read(&self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }

        let mut state = self.lock();
        let count = state.pop(dst);
        if count > 0 {
            self.not_full.notify_all();
        }
        count
    }

    /// 丢弃所有已缓冲的数据
    pub fn clear(&self) {
        let mut state = self.lock();
        state.available = 0;
        // 唤醒可能阻塞的生产者
        self.not_full.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.lock().available == 0
    }

    /// 阻塞直到缓冲区为空（Drain 使用），无超时
    pub fn wait_until_empty(&self) {
        let mut state = self.lock();
        while state.available > 0 {
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// 当前可读字节数
    #[inline]
    pub fn available(&self) -> usize {
        self.lock().available
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 返回是否成功锁定
    #[cfg(unix)]
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let result = unsafe { libc::mlock(self.data_addr as *const libc::c_void, self.capacity) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", self.capacity);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    #[cfg(not(unix))]
    pub fn lock_memory(&self) -> bool {
        false
    }

    /// 解锁缓冲区内存
    fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }

        #[cfg(unix)]
        unsafe {
            libc::munlock(self.data_addr as *const libc::c_void, self.capacity);
        }
        log::debug!("Ring buffer memory unlocked");
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
