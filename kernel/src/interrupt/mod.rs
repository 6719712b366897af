pub mod interrupt_dispatcher;
