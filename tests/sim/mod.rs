//! Simulated shared medium connecting several MACs
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use rand::rngs::mock::StepRng;

use lpwan_rfmac::Ts;
use lpwan_rfmac::timer::Timer;
use lpwan_rfmac::packet::Packet;
use lpwan_rfmac::mac_802154::{
    Config, Csma, CsmaConfig, DataConfirm, DataIndication, DataRequest, DeviceRole,
    FrameKind, Identity, Mac, MacListener, MacState, MacTrace, Phy, PhyEvent, PhyStatus,
    RxDropReason, TrxState, phy::LossyPhy,
};
use ieee802154::mac::{Address, AddressMode, ExtendedAddress, PanId, ShortAddress};

pub const PAN: PanId = PanId(0x0100);

/// Simulated time per step
pub const STEP_US: Ts = 100;

pub fn addr(short: u16) -> Address {
    Address::Short(PAN, ShortAddress(short))
}

pub fn broadcast() -> Address {
    Address::broadcast(&AddressMode::Short)
}

pub fn request(handle: u8, dst: Address, tx_options: u8) -> DataRequest {
    DataRequest {
        src_addr_mode: AddressMode::Short,
        dst,
        handle,
        tx_options,
    }
}

/// Frame placed on the medium
#[derive(Debug, Clone)]
pub struct Transmission {
    pub from: usize,
    pub at_us: Ts,
    pub psdu: Vec<u8>,
    pub kind: FrameKind,
}

impl Transmission {
    pub fn packet(&self) -> Packet {
        Packet::decode(&self.psdu, true).unwrap()
    }
}

#[derive(Default)]
struct Port {
    receiving: bool,
    inbox: VecDeque<(PhyEvent, Vec<u8>)>,
}

#[derive(Default)]
struct MediumInner {
    ports: Vec<Port>,
    history: Vec<Transmission>,
    jammed: bool,
}

/// Shared simulated time
#[derive(Clone, Default)]
pub struct SimTimer(Rc<Cell<Ts>>);

impl SimTimer {
    pub fn advance(&self, us: Ts) {
        self.0.set(self.0.get() + us);
    }
}

impl Timer for SimTimer {
    fn ticks_us(&self) -> Ts {
        self.0.get()
    }
}

/// Per-node radio attached to the medium
pub struct SimPhy {
    id: usize,
    medium: Rc<RefCell<MediumInner>>,
    timer: SimTimer,
}

impl Phy for SimPhy {
    type Error = ();

    fn set_trx_state(&mut self, state: TrxState) -> Result<(), ()> {
        let mut m = self.medium.borrow_mut();
        let port = &mut m.ports[self.id];

        port.receiving = state == TrxState::RxOn;

        let status = match state {
            TrxState::RxOn => PhyStatus::RxOn,
            TrxState::TxOn => PhyStatus::TxOn,
            TrxState::TrxOff => PhyStatus::TrxOff,
        };
        port.inbox.push_back((PhyEvent::TrxState(status), Vec::new()));

        Ok(())
    }

    fn transmit(&mut self, psdu: &[u8], kind: FrameKind) -> Result<(), ()> {
        let mut m = self.medium.borrow_mut();

        m.history.push(Transmission {
            from: self.id,
            at_us: self.timer.ticks_us(),
            psdu: psdu.to_vec(),
            kind,
        });

        // Deliver to every listening peer
        for (i, port) in m.ports.iter_mut().enumerate() {
            if i == self.id || !port.receiving {
                continue;
            }

            let ev = PhyEvent::Received{ len: psdu.len(), lqi: 255, kind: Some(kind) };
            port.inbox.push_back((ev, psdu.to_vec()));
        }

        m.ports[self.id].inbox.push_back((PhyEvent::DataConfirm(PhyStatus::Success), Vec::new()));

        Ok(())
    }

    fn request_cca(&mut self) -> Result<(), ()> {
        let mut m = self.medium.borrow_mut();

        let status = match m.jammed {
            true => PhyStatus::Busy,
            false => PhyStatus::Idle,
        };
        m.ports[self.id].inbox.push_back((PhyEvent::Cca(status), Vec::new()));

        Ok(())
    }

    fn poll(&mut self, buff: &mut [u8]) -> Result<Option<PhyEvent>, ()> {
        let mut m = self.medium.borrow_mut();

        let (ev, data) = match m.ports[self.id].inbox.pop_front() {
            Some(v) => v,
            None => return Ok(None),
        };

        buff[..data.len()].copy_from_slice(&data);

        Ok(Some(ev))
    }
}

/// Upper layer recording every MAC callback
#[derive(Default)]
pub struct Recorder {
    pub confirms: Vec<DataConfirm>,
    pub received: Vec<(DataIndication, Vec<u8>)>,
    pub energy: Vec<f64>,
    pub drops: Vec<RxDropReason>,
    pub states: Vec<MacState>,
    pub timeouts: Vec<MacState>,
}

impl MacListener for Recorder {
    fn data_confirm(&mut self, confirm: DataConfirm) {
        self.confirms.push(confirm);
    }

    fn data_indication(&mut self, ind: &DataIndication, payload: &[u8]) {
        self.received.push((*ind, payload.to_vec()));
    }

    fn energy_indication(&mut self, energy: f64) {
        self.energy.push(energy);
    }

    fn trace(&mut self, event: &MacTrace<'_>) {
        match event {
            MacTrace::RxDrop{ reason, .. } => self.drops.push(*reason),
            MacTrace::StateChange{ to, .. } => self.states.push(*to),
            MacTrace::HandshakeTimeout{ state } => self.timeouts.push(*state),
            _ => (),
        }
    }
}

pub type SimMac = Mac<LossyPhy<SimPhy, StepRng>, Csma<StepRng>, SimTimer, Recorder>;

/// Network of MACs sharing one channel and one clock
pub struct Sim {
    medium: Rc<RefCell<MediumInner>>,
    pub timer: SimTimer,
    pub nodes: Vec<SimMac>,
}

impl Sim {
    pub fn new() -> Self {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        Self {
            medium: Rc::new(RefCell::new(MediumInner::default())),
            timer: SimTimer::default(),
            nodes: Vec::new(),
        }
    }

    /// Attach a node with default configuration
    pub fn add(&mut self, short: u16, role: DeviceRole) -> usize {
        self.add_with(short, role, Config::default(), 0.0)
    }

    /// Attach a node dropping received data frames with `loss` probability
    pub fn add_with(&mut self, short: u16, role: DeviceRole, config: Config, loss: f32) -> usize {
        let id = self.nodes.len();
        self.medium.borrow_mut().ports.push(Port::default());

        let phy = SimPhy{ id, medium: self.medium.clone(), timer: self.timer.clone() };
        let phy = LossyPhy::new(phy, StepRng::new(0, 0), loss);

        let csma = Csma::new(CsmaConfig::default(), StepRng::new(0, 0));
        let identity = Identity::new(PAN, ShortAddress(short), ExtendedAddress(0x0100_0000 + short as u64));

        let mac = Mac::new(identity, role, config, phy, csma, self.timer.clone(), Recorder::default()).unwrap();
        self.nodes.push(mac);

        id
    }

    /// Tick every node once then advance time by one step
    pub fn step(&mut self) {
        for n in self.nodes.iter_mut() {
            n.tick().unwrap();
        }

        self.timer.advance(STEP_US);
    }

    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Run until the node reaches `state`, panics after `max_steps`
    pub fn run_until(&mut self, node: usize, state: MacState, max_steps: usize) {
        for _ in 0..max_steps {
            if self.nodes[node].state() == state {
                return;
            }
            self.step();
        }

        panic!("node {} did not reach {} (in {})", node, state, self.nodes[node].state());
    }

    /// Inject a sensed energy sample
    pub fn energy_sample(&mut self, node: usize, energy: f64, slot: u8) {
        let ev = PhyEvent::EnergySample{ energy, slot };
        self.medium.borrow_mut().ports[node].inbox.push_back((ev, Vec::new()));
    }

    /// Report every CCA as busy
    pub fn jam(&mut self, jammed: bool) {
        self.medium.borrow_mut().jammed = jammed;
    }

    pub fn history(&self) -> Vec<Transmission> {
        self.medium.borrow().history.clone()
    }

    /// Frame kinds in transmission order
    pub fn kinds(&self) -> Vec<FrameKind> {
        self.medium.borrow().history.iter().map(|t| t.kind).collect()
    }

    pub fn listener(&self, node: usize) -> &Recorder {
        self.nodes[node].listener()
    }
}
