use common::io::{Reg, RegisterWindow, WriteOnly};

/// One doorbell register. Doorbell 0 belongs to the command ring; doorbell `n` belongs to slot
/// `n` and takes the DCI of the endpoint with new work. XHC 5.6
pub struct Doorbell<'a>(WriteOnly<Reg<'a>>);

impl<'a> Doorbell<'a> {
    pub fn new(window: &'a dyn RegisterWindow, db_base: usize, index: u8) -> Self {
        Self(WriteOnly::new(Reg::new(window, db_base + usize::from(index) * 4)))
    }

    pub fn write(&mut self, data: u32) {
        self.0.write(data);
    }
}
