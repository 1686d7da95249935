// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The master instance: configuration graph, projected slaves, private
//! per-cycle state and the communication-phase switch.

use super::config::{ConfigGraph, DeviceStatus, ScanList, SlaveList};
use super::connection::{CheckMode, ConsState, ProdState};
use super::constant::*;
use super::dma::DmaState;
use super::error::Error;
use super::hal::Hal;
use super::layout::{CcConn, TelFields};

/// Instance creation options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Tx buffer slots of buffer system A (1..=3)
    pub tx_buffer_count: usize,
    /// Rx buffer slots of buffer system A per port (1..=3)
    pub rx_buffer_count: usize,
    /// route cyclic data through the PCI DMA mirror
    pub dma: bool,
    /// hardware supports the hot-plug field protocol
    pub hot_plug: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            tx_buffer_count: 1,
            rx_buffer_count: 1,
            dma: false,
            hot_plug: false,
        }
    }
}

/// Redundancy view of the current cycle: usable Rx buffers, telegram
/// valid masks and the telegram status of both ports.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Redundancy {
    pub rx_buffer: [usize; NBR_PORTS],
    pub at_buf_valid: [u32; NBR_PORTS],
    pub new_data: [bool; NBR_PORTS],
    pub tgsr: [u32; NBR_PORTS],
    pub pri_tel: [bool; NBR_PORTS],
    pub sec_tel: [bool; NBR_PORTS],
    /// MST flags of the previous cycle, for topology-change detection
    pub last_pri_tel: [bool; NBR_PORTS],
    pub last_sec_tel: [bool; NBR_PORTS],
}

/// The 8-byte hot-plug field: selection, control, info.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HotPlugField {
    pub selection: u16,
    pub control: u16,
    pub info: u32,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct HotPlugState {
    /// outbound MDT0 field, separately per egress port
    pub mdt0: [HotPlugField; NBR_PORTS],
    /// AT0 field read back per port
    pub at0: [HotPlugField; NBR_PORTS],
    /// MDT0 HP field location in the port-relative Tx buffers
    pub tx_offs: [u32; NBR_PORTS],
    pub enabled: bool,
    /// hot-plug protocol has taken over the field (stops t6/t7 warm-up)
    pub active: bool,
    pub phase: HotPlugPhase,
}

impl Default for HotPlugPhase {
    fn default() -> Self {
        HotPlugPhase::None
    }
}

/// Cyclic state of a master-produced connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MasterProducer {
    /// TSref production mask; zero while the connection is not
    /// master-produced
    pub produced: u16,
    pub state: ProdState,
    pub c_con: u16,
    pub tx_offs: [u32; MAX_BUF],
}

impl Default for MasterProducer {
    fn default() -> Self {
        MasterProducer {
            produced: 0,
            state: ProdState::Prepare,
            c_con: 0,
            tx_offs: [0; MAX_BUF],
        }
    }
}

/// Cyclic state of a slave-produced connection consumed by the master.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlaveProducer {
    pub produced: u16,
    pub state: ConsState,
    pub check_mode: CheckMode,
    pub expected_c_con: u16,
    pub latest_c_con: u16,
    pub consec_err: u16,
    pub absolute_err: u16,
    /// slave index of the producer
    pub prod_idx: u16,
    pub rx_offs: [[u32; MAX_BUF]; NBR_PORTS],
}

impl Default for SlaveProducer {
    fn default() -> Self {
        SlaveProducer {
            produced: 0,
            state: ConsState::Init,
            check_mode: CheckMode::NewData,
            expected_c_con: 0,
            latest_c_con: 0,
            consec_err: 0,
            absolute_err: 0,
            prod_idx: 0,
            rx_offs: [[0; MAX_BUF]; NBR_PORTS],
        }
    }
}

#[cfg(feature = "conn-trace")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnTraceEntry {
    pub conn_idx: u16,
    pub entry_state: u16,
    pub exit_state: u16,
    pub expected: u16,
    pub observed: u16,
}

#[cfg(feature = "conn-trace")]
#[derive(Debug, Default)]
pub(crate) struct ConnTrace {
    pub entries: Vec<ConnTraceEntry>,
    pub pos: usize,
}

#[cfg(feature = "conn-trace")]
impl ConnTrace {
    pub const DEPTH: usize = 256;

    pub fn record(&mut self, entry: ConnTraceEntry) {
        if self.entries.len() < Self::DEPTH {
            self.entries.push(entry);
        } else {
            self.entries[self.pos % Self::DEPTH] = entry;
        }
        self.pos = (self.pos + 1) % Self::DEPTH;
    }
}

/// Private per-cycle state, owned by the cycle thread.
#[derive(Debug)]
pub(crate) struct CycleState {
    pub monitoring: MonitoringMode,
    /// Tx buffer the processor may write this cycle
    pub tx_buffer: usize,
    pub redundancy: Redundancy,
    pub mdt_used: [bool; MAX_TEL],
    pub at_used: [bool; MAX_TEL],
    /// exclusive end of the cumulative slave-index range carried per AT
    pub s_dev_tel_end: [u16; MAX_TEL],
    /// preferred master port per slave
    pub pref_port: Vec<Port>,
    /// S-DEV location per slave, port and Rx buffer
    pub s_dev_offs: Vec<[[u32; MAX_BUF]; NBR_PORTS]>,
    /// C-DEV location per slave and Tx buffer
    pub c_dev_offs: Vec<[u32; MAX_BUF]>,
    pub master_prod: Vec<MasterProducer>,
    pub slave_prod: Vec<SlaveProducer>,
    /// cross-communication connections routed through the port-relative
    /// write buffer
    pub cc_conns: Vec<CcConn>,
    /// TSref counter value -> production bit mask
    pub tsref_list: Vec<u16>,
    pub timer_hp_cp3: u16,
    pub hp: HotPlugState,
    /// AT telegram start in Rx RAM per port, buffer and telegram
    pub rx_at_offs: [[[u32; MAX_TEL]; MAX_BUF]; NBR_PORTS],
    /// local mirror of received ATs for CP0/CP1, per port and telegram
    pub at_copy: [[Vec<u8>; MAX_TEL]; NBR_PORTS],
    pub at_copy_len: [u16; MAX_TEL],
    pub scan_p1: ScanList,
    pub scan_p2: ScanList,
    pub last_addr_p1: u16,
    pub last_addr_p2: u16,
    pub p1_active: bool,
    pub p2_active: bool,
    /// HP section length of the port-relative Tx buffer
    pub tx_port_offset: u16,
    /// port-relative buffer bases in Tx RAM
    pub tx_prel_offs: [u32; NBR_PORTS],
    pub tx_prel_len: u16,
    /// MDT RTD region start in Tx RAM (buffer 0) per telegram
    pub mdt_rtd_offs: [u32; MAX_TEL],
    /// AT master-produced RTD region start in Tx RAM (buffer 0)
    pub at_rtd_offs: [u32; MAX_TEL],
    /// stride between Tx buffer slots
    pub tx_buf0_len: u16,
    /// AT start offset inside one Rx data buffer per telegram
    pub rx_buf_len: [u16; MAX_TEL],
    pub mdt_fields: [TelFields; MAX_TEL],
    pub at_fields: [TelFields; MAX_TEL],
    pub rx_ram_in_use: u32,
    pub tx_ram_in_use: u32,
    pub tx_buffer_count: usize,
    pub rx_buffer_count: usize,
}

impl CycleState {
    fn new(options: &Options) -> CycleState {
        CycleState {
            monitoring: MonitoringMode::Off,
            tx_buffer: 0,
            redundancy: Redundancy::default(),
            mdt_used: [false; MAX_TEL],
            at_used: [false; MAX_TEL],
            s_dev_tel_end: [0; MAX_TEL],
            pref_port: Vec::new(),
            s_dev_offs: Vec::new(),
            c_dev_offs: Vec::new(),
            master_prod: vec![MasterProducer::default(); MAX_GLOB_CONN],
            slave_prod: vec![SlaveProducer::default(); MAX_GLOB_CONN],
            cc_conns: Vec::new(),
            tsref_list: build_tsref_list(),
            timer_hp_cp3: 0,
            hp: HotPlugState::default(),
            rx_at_offs: [[[0; MAX_TEL]; MAX_BUF]; NBR_PORTS],
            at_copy: Default::default(),
            at_copy_len: [0; MAX_TEL],
            scan_p1: ScanList::default(),
            scan_p2: ScanList::default(),
            last_addr_p1: 0,
            last_addr_p2: 0,
            p1_active: true,
            p2_active: true,
            tx_port_offset: 0,
            tx_prel_offs: [0; NBR_PORTS],
            tx_prel_len: 0,
            mdt_rtd_offs: [0; MAX_TEL],
            at_rtd_offs: [0; MAX_TEL],
            tx_buf0_len: 0,
            rx_buf_len: [0; MAX_TEL],
            mdt_fields: [TelFields::default(); MAX_TEL],
            at_fields: [TelFields::default(); MAX_TEL],
            rx_ram_in_use: 0,
            tx_ram_in_use: 0,
            tx_buffer_count: options.tx_buffer_count,
            rx_buffer_count: options.rx_buffer_count,
        }
    }
}

/// Production bit masks: a connection produced every `ratio` cycles gets
/// the bit `log2(ratio)`; list entry `t` carries the bit of every ratio
/// that divides `t`.
fn build_tsref_list() -> Vec<u16> {
    let mut list = vec![0u16; TSREF_LIST_LENGTH];
    for (t, entry) in list.iter_mut().enumerate() {
        for bit in 0..TSREF_MAX_RATIO_BITS {
            if t % (1usize << bit) == 0 {
                *entry |= 1 << bit;
            }
        }
    }
    list
}

pub(crate) fn production_mask(ratio: u32) -> Option<u16> {
    if !ratio.is_power_of_two() || ratio.trailing_zeros() >= u32::from(TSREF_MAX_RATIO_BITS) {
        return None;
    }
    Some(1 << ratio.trailing_zeros())
}

/// A Sercos III master instance driving one FPGA.
///
/// # Examples
///
/// ```
/// use sercos3::{master::{Master, Options}, sim::SoftFpga, constant::Phase};
///
/// let mut master = Master::open(SoftFpga::new(), Default::default(), Options::default()).unwrap();
/// master.project_slaves(&[3, 5]).unwrap();
/// master.set_phase(Phase::Cp0).unwrap();
/// let result = master.cyclic_handling();
/// println!("cycle: {:?}", result);
/// ```
#[derive(Debug)]
pub struct Master<H: Hal> {
    pub(crate) hal: H,
    pub(crate) phase: Phase,
    pub config: ConfigGraph,
    pub slaves: SlaveList,
    /// activity per projected slave
    pub(crate) activity: Vec<Activity>,
    /// public S-DEV and miss counter per projected slave
    pub(crate) dev_status: Vec<DeviceStatus>,
    /// C-DEV source words, copied into Tx RAM every cycle
    pub(crate) dev_control: Vec<u16>,
    pub(crate) state: CycleState,
    pub(crate) dma: DmaState,
    #[cfg(feature = "conn-trace")]
    pub(crate) trace: ConnTrace,
}

impl<H: Hal> Master<H> {
    pub fn open(hal: H, config: ConfigGraph, options: Options) -> Result<Master<H>, Error> {
        if options.tx_buffer_count == 0
            || options.tx_buffer_count > MAX_BUF
            || options.rx_buffer_count == 0
            || options.rx_buffer_count > MAX_BUF
        {
            return Err(Error::SystemError);
        }
        let mut master = Master {
            hal,
            phase: Phase::Nrt,
            config,
            slaves: SlaveList::new(),
            activity: Vec::new(),
            dev_status: Vec::new(),
            dev_control: Vec::new(),
            state: CycleState::new(&options),
            dma: DmaState::new(options.dma),
            #[cfg(feature = "conn-trace")]
            trace: ConnTrace::default(),
        };
        master.state.hp.enabled = options.hot_plug;
        Ok(master)
    }

    /// Tear the instance down and hand the hardware back.
    pub fn close(mut self) -> H {
        self.state.monitoring = MonitoringMode::Off;
        self.hal
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn monitoring_mode(&self) -> MonitoringMode {
        self.state.monitoring
    }

    pub fn set_monitoring_mode(&mut self, mode: MonitoringMode) {
        self.state.monitoring = mode;
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Direct hardware access, for diagnostics and tests.
    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// Establish the projected slave list (the result of the CP0 address
    /// scan) and size all per-slave state. Both topology scan lists
    /// default to a single line on port 1.
    pub fn project_slaves(&mut self, addresses: &[u16]) -> Result<(), Error> {
        self.slaves.project(addresses)?;
        let n = addresses.len();
        self.activity = vec![Activity::Active; n];
        self.dev_status = vec![DeviceStatus::default(); n];
        self.dev_control = vec![0; n];
        self.state.pref_port = vec![Port::Port1; n];
        self.state.s_dev_offs = vec![[[0; MAX_BUF]; NBR_PORTS]; n];
        self.state.c_dev_offs = vec![[0; MAX_BUF]; n];
        self.state.scan_p1 = ScanList::from_addresses(addresses);
        self.state.scan_p2 = ScanList::from_addresses(&[]);
        self.state.last_addr_p1 = self.state.scan_p1.last_address();
        self.state.last_addr_p2 = 0;
        Ok(())
    }

    /// Replace the topology scan lists when the ring is split over both
    /// ports (double line).
    pub fn set_topology(&mut self, port1: &[u16], port2: &[u16]) {
        self.state.scan_p1 = ScanList::from_addresses(port1);
        self.state.scan_p2 = ScanList::from_addresses(port2);
        self.state.last_addr_p1 = self.state.scan_p1.last_address();
        self.state.last_addr_p2 = self.state.scan_p2.last_address();
        self.state.p1_active = !port1.is_empty();
        self.state.p2_active = !port2.is_empty();
    }

    pub fn num_slaves(&self) -> usize {
        self.slaves.num_proj_slaves()
    }

    pub fn activity(&self, slave_idx: usize) -> Activity {
        self.activity[slave_idx]
    }

    /// Public device status of a slave as evaluated this cycle.
    pub fn device_status(&self, slave_idx: usize) -> DeviceStatus {
        self.dev_status[slave_idx]
    }

    /// Set the C-DEV word the cyclic engine copies for this slave.
    pub fn set_device_control(&mut self, slave_idx: usize, c_dev: u16) {
        self.dev_control[slave_idx] = c_dev;
    }

    pub fn device_control(&self, slave_idx: usize) -> u16 {
        self.dev_control[slave_idx]
    }

    pub fn preferred_port(&self, slave_idx: usize) -> Port {
        self.state.pref_port[slave_idx]
    }

    /// Switch the communication phase. The monitoring gate is closed for
    /// the duration of the switch; on failure the master stays in the
    /// previous phase with its previous layout.
    pub fn set_phase(&mut self, phase: Phase) -> Result<(), Error> {
        let previous = self.phase;
        self.state.monitoring = MonitoringMode::Off;
        let result = self.configure_phase(phase);
        match result {
            Ok(()) => {
                if previous == Phase::Cp4 && phase < Phase::Cp4 {
                    self.clear_connection_states();
                }
                self.phase = phase;
                if phase >= Phase::Cp0 {
                    self.state.monitoring = MonitoringMode::Full;
                }
                Ok(())
            }
            Err(e) => {
                if previous >= Phase::Cp0 {
                    self.state.monitoring = MonitoringMode::Full;
                }
                Err(e)
            }
        }
    }

    fn configure_phase(&mut self, phase: Phase) -> Result<(), Error> {
        match phase {
            Phase::Nrt => Ok(()),
            Phase::Cp0 => {
                self.config_tx_tel_p0()?;
                self.config_rx_tel_p0()
            }
            Phase::Cp1 => {
                self.config_tx_tel_p1()?;
                self.config_rx_tel_p1()
            }
            Phase::Cp2 => {
                self.config_tx_tel_p2()?;
                self.config_rx_tel_p2()
            }
            Phase::Cp3 => {
                self.derive_cp34_timing()?;
                self.config_tx_tel_p3()?;
                self.config_rx_tel_p3()?;
                self.state.timer_hp_cp3 = 0;
                Ok(())
            }
            Phase::Cp4 => {
                if self.phase != Phase::Cp3 {
                    return Err(Error::WrongPhase);
                }
                self.activate_connections()?;
                self.clear_tx_cc_data();
                Ok(())
            }
        }
    }

    /// Drop all producer and consumer state on leaving CP4.
    fn clear_connection_states(&mut self) {
        for prod in self.state.master_prod.iter_mut() {
            *prod = MasterProducer::default();
        }
        for cons in self.state.slave_prod.iter_mut() {
            *cons = SlaveProducer::default();
        }
    }

    /// Instantiate producer/consumer state for every active connection of
    /// the master on the CP3 -> CP4 transition.
    fn activate_connections(&mut self) -> Result<(), Error> {
        let num_slaves = self.num_slaves();
        let cycle_ns = self.config.timing.cycle_time_ns;
        for slot in self.config.master.slots.iter() {
            if !slot.is_used() {
                continue;
            }
            let conn_idx = slot.conn_idx as usize;
            let conn = &self.config.connections[conn_idx];
            let setup = &self.config.configurations[slot.config_idx as usize];
            if !setup.is_active() {
                continue;
            }
            if conn.cycle_time == 0 || cycle_ns == 0 || conn.cycle_time % cycle_ns != 0 {
                return Err(Error::CycleTimeUnequal);
            }
            let mask = match production_mask(conn.cycle_time / cycle_ns) {
                Some(mask) => mask,
                None => return Err(Error::CycleTimeUnequal),
            };
            if setup.is_active_producer() {
                let prod = &mut self.state.master_prod[conn_idx];
                prod.produced = mask;
                prod.state = ProdState::Prepare;
                prod.c_con = 0;
            } else {
                let producer = self
                    .config
                    .producer_of(slot.conn_idx, num_slaves)
                    .ok_or(Error::NoProducer)?;
                let prod_idx = match producer {
                    super::config::ProducerId::Slave(idx) => idx,
                    super::config::ProducerId::Master => return Err(Error::SystemError),
                };
                let cons = &mut self.state.slave_prod[conn_idx];
                cons.produced = mask;
                cons.prod_idx = prod_idx;
                cons.state = ConsState::Prepare;
                cons.check_mode = CheckMode::NewData;
                cons.expected_c_con = 0;
                cons.latest_c_con = 0;
                cons.consec_err = 0;
                cons.absolute_err = 0;
            }
        }
        Ok(())
    }

    // --- buffer system accessors ---------------------------------------

    /// Active Tx buffer of buffer system A usable by the processor.
    pub fn usable_tx_buffer(&mut self) -> usize {
        self.hal.usable_tx_buffer()
    }

    /// Active Rx buffers of buffer system A for port 1 and port 2.
    pub fn usable_rx_buffers(&mut self) -> (usize, usize) {
        self.hal.usable_rx_buffers()
    }

    /// Newly-received flags of the usable Rx buffers.
    pub fn is_rx_buffer_valid(&mut self) -> (bool, bool) {
        self.hal.rx_buffer_valid()
    }

    // --- interrupts ----------------------------------------------------

    pub fn check_interrupt(&self) -> u32 {
        self.hal.interrupt_status()
    }

    pub fn clear_interrupt(&mut self, mask: u32) {
        self.hal.clear_interrupt(mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SoftFpga;

    #[test]
    fn test_tsref_list_divisors() {
        let list = build_tsref_list();
        // every cycle carries bit 0
        assert_eq!(list[1] & 0x1, 0x1);
        assert_eq!(list[7] & 0x1, 0x1);
        // ratio 4 (bit 2) only on multiples of 4
        assert_eq!(list[4] & 0x4, 0x4);
        assert_eq!(list[6] & 0x4, 0);
        // t = 0 matches every ratio
        assert_eq!(list[0], 0xFFFF);
    }

    #[test]
    fn test_production_mask() {
        assert_eq!(production_mask(1), Some(0x0001));
        assert_eq!(production_mask(8), Some(0x0008));
        assert_eq!(production_mask(3), None);
        assert_eq!(production_mask(0), None);
    }

    #[test]
    fn test_open_rejects_bad_buffer_counts() {
        let options = Options {
            tx_buffer_count: 0,
            ..Options::default()
        };
        assert!(Master::open(SoftFpga::new(), Default::default(), options).is_err());
    }

    #[test]
    fn test_project_slaves_sizes_state() {
        let mut master =
            Master::open(SoftFpga::new(), Default::default(), Options::default()).unwrap();
        master.project_slaves(&[3, 5, 9]).unwrap();
        assert_eq!(master.num_slaves(), 3);
        assert_eq!(master.preferred_port(2), Port::Port1);
        assert_eq!(master.state.scan_p1.addresses, vec![0, 3, 5, 9]);
        assert_eq!(master.state.last_addr_p1, 9);
    }

    #[test]
    fn test_cp4_requires_cp3() {
        let mut master =
            Master::open(SoftFpga::new(), Default::default(), Options::default()).unwrap();
        master.project_slaves(&[1]).unwrap();
        assert_eq!(master.set_phase(Phase::Cp4), Err(Error::WrongPhase));
    }
}
