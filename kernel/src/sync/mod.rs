pub mod irqsave_spinlock;
