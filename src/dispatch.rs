/**
 * Hand-off from interrupt handlers to the main loop.
 *
 * Handlers push a `Message` onto the main queue and return. The main loop pops messages with
 * interrupts masked and does the actual work with interrupts enabled, so handler work never
 * lengthens a masked window. There is exactly one producer (the installed handler) and one
 * consumer (the loop), and messages are handled in arrival order.
 */

use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};

use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;

use crate::error::{Error, ErrorKind, Result};
use crate::log::LogLevel;
use crate::{log, make_error};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    InterruptXhci = 0,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(raw: u8) -> core::result::Result<Self, u8> {
        match raw {
            0 => Ok(MessageType::InterruptXhci),
            unknown => Err(unknown),
        }
    }
}

// A fixed-size notification. The tag is kept raw so a message the loop does not understand
// can be reported instead of misread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    raw_type: u8,
}

impl Message {
    pub const fn new(ty: MessageType) -> Self {
        Message { raw_type: ty as u8 }
    }

    pub const fn from_raw(raw_type: u8) -> Self {
        Message { raw_type }
    }

    pub fn message_type(&self) -> core::result::Result<MessageType, u8> {
        MessageType::try_from(self.raw_type)
    }
}

// Bounded FIFO between interrupt context and the main loop. A full queue rejects the message;
// nothing already queued is overwritten.
pub struct MessageQueue {
    queue: ArrayQueue<Message>,
    dropped: AtomicUsize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        MessageQueue {
            queue: ArrayQueue::new(capacity),
            dropped: AtomicUsize::new(0),
        }
    }

    // Must not block or allocate: called from interrupt handlers.
    pub fn push(&self, message: Message) -> Result<()> {
        self.queue.push(message).map_err(|_| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            make_error!(ErrorKind::ResourceExhausted)
        })
    }

    pub fn pop(&self) -> Option<Message> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    // Number of messages rejected since the last call.
    pub fn take_dropped(&self) -> usize {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

static MAIN_QUEUE: OnceCell<MessageQueue> = OnceCell::uninit();

// Handle to the initialised main queue. Only `init_main_queue` hands these out, so holding
// one proves the queue exists; arming an interrupt vector requires it.
#[derive(Clone, Copy)]
pub struct MainQueue {
    queue: &'static MessageQueue,
}

impl Deref for MainQueue {
    type Target = MessageQueue;

    fn deref(&self) -> &MessageQueue {
        self.queue
    }
}

// Creates the main queue. Needs the heap; must run before any vector that feeds it is armed.
pub fn init_main_queue(capacity: usize) -> Result<MainQueue> {
    MAIN_QUEUE
        .try_init_once(|| MessageQueue::new(capacity))
        .map_err(|_| make_error!(ErrorKind::AlreadyInitialized))?;
    main_queue().ok_or(make_error!(ErrorKind::NotFound))
}

pub fn main_queue() -> Option<MainQueue> {
    MAIN_QUEUE.get().map(|queue| MainQueue { queue })
}

// Tests across modules share the one main queue; whoever comes first creates it.
#[cfg(test)]
pub(crate) fn test_main_queue() -> MainQueue {
    let queue = MAIN_QUEUE.get_or_init(|| MessageQueue::new(8));
    MainQueue { queue }
}

// Interrupt-context enqueue. A full queue drops the message and bumps the drop counter; the
// main loop reports it.
pub fn signal(message: Message) {
    if let Ok(queue) = MAIN_QUEUE.try_get() {
        let _ = queue.push(message);
    }
}

// Control over the CPU interrupt flag.
pub trait InterruptControl {
    fn disable(&mut self);
    fn enable(&mut self);
    // Enables interrupts and halts until the next one, with nothing in between: an interrupt
    // that becomes pending after the queue was found empty still wakes the halt.
    fn enable_and_halt(&mut self);
}

// The executing CPU.
pub struct Cpu;

impl InterruptControl for Cpu {
    fn disable(&mut self) {
        x86_64::instructions::interrupts::disable();
    }

    fn enable(&mut self) {
        x86_64::instructions::interrupts::enable();
    }

    fn enable_and_halt(&mut self) {
        // `sti; hlt`: sti only takes effect after the following instruction
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

// Consumer of dequeued messages.
pub trait MessageHandler {
    fn handle(&mut self, message: MessageType) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    // the queue was empty and the CPU halted until an interrupt
    Idle,
    Handled(Message),
}

pub struct Dispatcher<'q, I: InterruptControl> {
    queue: &'q MessageQueue,
    cpu: I,
}

impl<'q, I: InterruptControl> Dispatcher<'q, I> {
    pub fn new(queue: &'q MessageQueue, cpu: I) -> Self {
        Dispatcher { queue, cpu }
    }

    pub fn cpu(&self) -> &I {
        &self.cpu
    }

    // One cycle of the loop.
    pub fn step(&mut self, handler: &mut impl MessageHandler) -> Step {
        self.cpu.disable();
        let Some(message) = self.queue.pop() else {
            self.cpu.enable_and_halt();
            return Step::Idle;
        };
        self.cpu.enable();

        let dropped = self.queue.take_dropped();
        if dropped > 0 {
            log!(LogLevel::Warn, "main queue full: {} message(s) dropped", dropped);
        }

        match message.message_type() {
            Ok(ty) => {
                if let Err(err) = handler.handle(ty) {
                    report(ty, &err);
                }
            }
            Err(raw) => log!(LogLevel::Error, "Unknown message type: {}", raw),
        }
        Step::Handled(message)
    }

    // Runs the loop for the rest of the kernel's lifetime.
    pub fn run(mut self, handler: &mut impl MessageHandler) -> ! {
        loop {
            self.step(handler);
        }
    }
}

fn report(ty: MessageType, err: &Error) {
    log!(LogLevel::Error, "Error while handling {:?}: {}", ty, err);
}
