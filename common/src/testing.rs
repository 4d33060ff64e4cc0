use std::{cell::Cell, rc::Rc};

use crate::{
    link::{BtTransport, Clock},
    packet::Command,
    types::{DiscoveredDevice, MacAddress},
};

/// Clock that only moves when told to; sleeping advances it.
#[derive(Debug, Clone, Default)]
pub(crate) struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub(crate) fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }
}

#[derive(Debug)]
pub(crate) struct FakeTransport {
    clock: ManualClock,
    pub(crate) frames: Vec<(u64, Vec<u8>)>,
    pub(crate) connects: Vec<MacAddress>,
    pub(crate) disconnects: usize,
    pub(crate) discoveries: Vec<(u64, u64)>,
    pub(crate) nearby: Vec<DiscoveredDevice>,
    pub(crate) fail_writes: bool,
}

impl FakeTransport {
    pub(crate) fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            frames: Vec::new(),
            connects: Vec::new(),
            disconnects: 0,
            discoveries: Vec::new(),
            nearby: Vec::new(),
            fail_writes: false,
        }
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.frames.iter().map(|(_, frame)| frame.clone()).collect()
    }
}

impl BtTransport for FakeTransport {
    type Error = &'static str;

    fn connect(&mut self, mac: MacAddress) -> Result<(), Self::Error> {
        self.connects.push(mac);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.disconnects += 1;
        Ok(())
    }

    fn write(&mut self, frame: &[u8]) -> Result<(), Self::Error> {
        if self.fail_writes {
            return Err("write rejected");
        }
        self.frames.push((self.clock.now_ms(), frame.to_vec()));
        Ok(())
    }

    fn discover(&mut self, timeout_ms: u64) -> Result<Vec<DiscoveredDevice>, Self::Error> {
        self.discoveries.push((self.clock.now_ms(), timeout_ms));
        Ok(self.nearby.clone())
    }
}

pub(crate) fn frames(commands: &[Command]) -> Vec<Vec<u8>> {
    commands
        .iter()
        .map(|cmd| cmd.encode().expect("test command encodes"))
        .collect()
}

pub(crate) fn mac(last: u8) -> MacAddress {
    MacAddress::new([0xC9, 0xA3, 0x05, 0x36, 0xC4, last])
}

pub(crate) fn device(name: &str, address: MacAddress) -> DiscoveredDevice {
    DiscoveredDevice {
        name: name.to_string(),
        address,
    }
}
