// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The cyclic engine: called once per Sercos cycle, it rotates the
//! multi-buffer system, validates received telegrams, maintains topology
//! and redundancy state, copies device control/status, services the
//! hot-plug fields and drives the connection state machines.

use super::config::DeviceStatus;
use super::constant::*;
use super::error::CyclicResult;
use super::hal::{at_valid_mask, Hal, Tgsr};
use super::master::{HotPlugField, Master};

impl<H: Hal> Master<H> {
    /// One Sercos cycle.
    ///
    /// Must be called exactly once per cycle from the cycle tick. While
    /// the monitoring gate is closed (phase switch in progress) the call
    /// returns immediately.
    pub fn cyclic_handling(&mut self) -> CyclicResult {
        if self.state.monitoring == MonitoringMode::Off {
            return CyclicResult::Ok;
        }

        // multi-buffer handling: fetch the writable Tx buffer; without
        // DMA also order and fetch the readable Rx buffers
        self.state.tx_buffer = self.hal.usable_tx_buffer();
        if !self.dma.active {
            self.hal.request_new_rx_buffer();
            let (b1, b2) = self.hal.usable_rx_buffers();
            self.state.redundancy.rx_buffer = [b1, b2];
        }

        // telegram validation
        let (n1, n2) = self.hal.rx_buffer_valid();
        self.state.redundancy.new_data = [n1, n2];
        let rxbuftv = self.hal.valid_telegrams();
        self.state.redundancy.at_buf_valid = [
            at_valid_mask(rxbuftv, Port::Port1),
            at_valid_mask(rxbuftv, Port::Port2),
        ];
        self.read_telegram_status();

        let mut result = CyclicResult::Ok;
        let rx_buf = self.state.redundancy.rx_buffer;

        if self.phase >= Phase::Cp0 {
            if self.dma.active {
                if self.state.p1_active || self.state.p2_active {
                    let channels = self.dma.tx_start_p1[rx_buf[0]] | self.dma.tx_start_p2[rx_buf[1]];
                    if !self.wait_tx_dma(channels) {
                        result = CyclicResult::TelegramOverrun;
                    }
                }
            } else if self.phase < Phase::Cp2 {
                // CP0/CP1: the descriptor engine is not yet in charge of
                // the AT payload, copy it into the local mirror
                for tel in 0..MAX_TEL {
                    if !self.state.at_used[tel] || self.state.at_copy_len[tel] == 0 {
                        continue;
                    }
                    for port in 0..NBR_PORTS {
                        let active = if port == 0 {
                            self.state.p1_active
                        } else {
                            self.state.p2_active
                        };
                        if !active {
                            continue;
                        }
                        let src = self.state.rx_at_offs[port][rx_buf[port]][tel];
                        let mut copy = std::mem::take(&mut self.state.at_copy[port][tel]);
                        self.hal.read_rx_block(src, &mut copy);
                        self.state.at_copy[port][tel] = copy;
                    }
                }
            }
        }

        if self.phase >= Phase::Cp1 {
            result = self.check_topology();
            self.cyclic_device_control();
            self.cyclic_device_status();
        }

        if self.phase >= Phase::Cp3 {
            self.cyclic_hot_plug_mdt();
            self.cyclic_hot_plug_at();
        }

        if self.phase == Phase::Cp4 {
            self.cyclic_connection();
            self.evaluate_connections();
        }

        if self.phase >= Phase::Cp3 {
            self.hal.request_new_tx_buffer();
        } else if self.phase == Phase::Cp2 && self.dma.active {
            let channels = self.dma.rx_start[self.state.tx_buffer];
            self.dma.clear_rx_ready(channels);
            self.hal.start_rx_dma(channels);
        }

        result
    }

    /// Read and clear the telegram status registers of both ports and
    /// derive the primary/secondary MST-valid flags.
    pub(crate) fn read_telegram_status(&mut self) {
        let clearable = (Tgsr::AT0_MISS
            | Tgsr::MST_DMISS
            | Tgsr::MST_MISS
            | Tgsr::MST_WIN_ERR
            | Tgsr::MST_VALID)
            .bits();

        self.state.redundancy.last_pri_tel = self.state.redundancy.pri_tel;
        self.state.redundancy.last_sec_tel = self.state.redundancy.sec_tel;

        for port in [Port::Port1, Port::Port2] {
            let raw = self.hal.telegram_status(port);
            self.state.redundancy.tgsr[port.index()] = raw;
            self.hal.clear_telegram_status(port, clearable);

            let tgsr = Tgsr::from_bits_retain(raw);
            let mst_ok = tgsr.contains(Tgsr::MST_VALID);
            self.state.redundancy.sec_tel[port.index()] = mst_ok && tgsr.contains(Tgsr::SEC_TEL);
            self.state.redundancy.pri_tel[port.index()] = mst_ok && !tgsr.contains(Tgsr::SEC_TEL);
        }
    }

    /// Map the derived MST flags onto a cycle result.
    ///
    /// Deterministic policy: missing link on both ports outranks missing
    /// telegrams, which outranks an MST monitoring-window violation; a
    /// change of the valid-MST pattern against the previous cycle is
    /// reported exactly once as `TopologyChange`.
    pub(crate) fn check_topology(&mut self) -> CyclicResult {
        let red = &self.state.redundancy;
        let t1 = Tgsr::from_bits_retain(red.tgsr[0]);
        let t2 = Tgsr::from_bits_retain(red.tgsr[1]);
        let link1 = self.state.p1_active && t1.contains(Tgsr::LINK);
        let link2 = self.state.p2_active && t2.contains(Tgsr::LINK);
        if !link1 && !link2 {
            return CyclicResult::NoLinkAttached;
        }

        let valid1 = red.pri_tel[0] || red.sec_tel[0];
        let valid2 = red.pri_tel[1] || red.sec_tel[1];
        if !(valid1 || valid2) {
            let missed = (t1.union(t2)).intersects(Tgsr::MST_MISS | Tgsr::MST_DMISS);
            return if missed {
                CyclicResult::MstMiss
            } else {
                CyclicResult::NoTelegramsReceived
            };
        }
        if (t1.union(t2)).contains(Tgsr::MST_WIN_ERR) {
            return CyclicResult::MstWindowError;
        }
        if red.pri_tel != red.last_pri_tel || red.sec_tel != red.last_sec_tel {
            return CyclicResult::TopologyChange;
        }
        CyclicResult::Ok
    }

    /// Copy the C-DEV word of every active slave into the Tx buffer the
    /// master may currently write.
    pub(crate) fn cyclic_device_control(&mut self) {
        let buf = self.state.tx_buffer;
        for slave in 0..self.num_slaves() {
            if self.activity[slave] == Activity::Inactive {
                continue;
            }
            let offset = self.state.c_dev_offs[slave][buf];
            let value = self.dev_control[slave];
            self.write_tx_word(offset, value);
        }
    }

    /// Evaluate the S-DEV of every active slave over both ports,
    /// switching the preferred port when slave valid only arrives on the
    /// alternative one.
    pub(crate) fn cyclic_device_status(&mut self) {
        let rx_buf = self.state.redundancy.rx_buffer;
        let at_valid = self.state.redundancy.at_buf_valid;
        let mut slave_idx = 0usize;

        for tel in 0..MAX_TEL {
            if !self.state.at_used[tel] {
                continue;
            }
            let end = (self.state.s_dev_tel_end[tel] as usize).min(self.num_slaves());
            let tel_mask = 1u32 << tel;

            if (at_valid[0] | at_valid[1]) & tel_mask == 0 {
                // AT not received on either port: every slave in its
                // range takes a slave-valid miss
                while slave_idx < end {
                    if self.activity[slave_idx] == Activity::Active {
                        self.slave_valid_error(slave_idx);
                    }
                    slave_idx += 1;
                }
                continue;
            }

            while slave_idx < end {
                if self.activity[slave_idx] != Activity::Active {
                    slave_idx += 1;
                    continue;
                }
                let pref = self.state.pref_port[slave_idx];
                let mut resolved = false;

                if at_valid[pref.index()] & tel_mask != 0 {
                    let offset = self.state.s_dev_offs[slave_idx][pref.index()][rx_buf[pref.index()]];
                    let s_dev = self.read_rx_word(offset);
                    if s_dev & S_DEV_SLAVE_VALID != 0 {
                        self.dev_status[slave_idx] = DeviceStatus { s_dev, miss: 0 };
                        resolved = true;
                    }
                }
                if !resolved {
                    let other = pref.other();
                    if at_valid[other.index()] & tel_mask != 0 {
                        let offset =
                            self.state.s_dev_offs[slave_idx][other.index()][rx_buf[other.index()]];
                        let s_dev = self.read_rx_word(offset);
                        if s_dev & S_DEV_SLAVE_VALID != 0 {
                            // adopt the alternative port for everything
                            // the master consumes from this slave
                            self.state.pref_port[slave_idx] = other;
                            self.dev_status[slave_idx] = DeviceStatus { s_dev, miss: 0 };
                            resolved = true;
                        }
                    }
                }
                if !resolved {
                    self.slave_valid_error(slave_idx);
                }
                slave_idx += 1;
            }
        }
    }

    /// Slave valid missing on both ports: zero the public S-DEV, count
    /// the miss under full monitoring and remove the slave above the
    /// configured threshold.
    pub(crate) fn slave_valid_error(&mut self, slave_idx: usize) {
        self.dev_status[slave_idx].s_dev = 0;
        if self.state.monitoring == MonitoringMode::Full {
            self.dev_status[slave_idx].miss += 1;
        }
        if self.dev_status[slave_idx].miss > self.config.timing.allowed_slave_valid_miss {
            self.delete_slave(slave_idx);
        }
    }

    /// Remove a slave from the topology scan lists. Slaves behind it on
    /// the same port are unreachable and removed as well; the address
    /// stays in the deactivated list for a later hot-plug re-scan.
    pub(crate) fn delete_slave(&mut self, slave_idx: usize) {
        let address = self.slaves.proj[slave_idx];
        self.activity[slave_idx] = Activity::Inactive;

        let mut found = false;
        if let Some(pos) = self.state.scan_p1.addresses[1..]
            .iter()
            .position(|&a| a == address)
        {
            self.state.scan_p1.addresses.truncate(pos + 1);
            self.state.last_addr_p1 = self.state.scan_p1.last_address();
            found = true;
        }
        if !found {
            if let Some(pos) = self.state.scan_p2.addresses[1..]
                .iter()
                .position(|&a| a == address)
            {
                self.state.scan_p2.addresses.truncate(pos + 1);
                self.state.last_addr_p2 = self.state.scan_p2.last_address();
            }
        }
        if !self.slaves.deactivated.contains(&address) {
            self.slaves.deactivated.push(address);
        }
    }

    /// Service the MDT0 hot-plug field. During the CP3 warm-up the UC
    /// bandwidth parameters t6 and t7 are broadcast, each for
    /// `HP_CP3_REPEAT_RATE_T6_T7` cycles, then the field returns to its
    /// defaults; afterwards the externally maintained field contents are
    /// emitted while hot plug is supported.
    pub(crate) fn cyclic_hot_plug_mdt(&mut self) {
        let timer = self.state.timer_hp_cp3;
        if timer <= 2 * HP_CP3_REPEAT_RATE_T6_T7 {
            if !self.state.hp.active {
                if timer == 0 {
                    let field = &mut self.state.hp.mdt0[0];
                    field.selection = HP_ADD_BRDCST_ADD;
                    field.control = (field.control & !HP_CNTRL_PAR_CODING_MASK) | HP_CODE_T6;
                    field.info = self.config.timing.t6_uc_begin;
                    self.state.hp.mdt0[1] = self.state.hp.mdt0[0];
                } else if timer == HP_CP3_REPEAT_RATE_T6_T7 {
                    let field = &mut self.state.hp.mdt0[0];
                    field.control = (field.control & !HP_CNTRL_PAR_CODING_MASK) | HP_CODE_T7;
                    field.info = self.config.timing.t7_uc_end;
                    self.state.hp.mdt0[1] = self.state.hp.mdt0[0];
                } else if timer == 2 * HP_CP3_REPEAT_RATE_T6_T7 {
                    let field = &mut self.state.hp.mdt0[0];
                    field.selection = HP_ADD_DEFAULT_SADD;
                    field.control &= !HP_CNTRL_PAR_CODING_MASK;
                    field.info = 0;
                    self.state.hp.mdt0[1] = self.state.hp.mdt0[0];
                }
            } else {
                // hot plug took over, terminate the t6/t7 warm-up
                self.state.timer_hp_cp3 = 2 * HP_CP3_REPEAT_RATE_T6_T7;
            }
            self.state.timer_hp_cp3 += 1;
            self.write_hp_fields();
        } else if self.state.hp.enabled {
            self.write_hp_fields();
        }
    }

    fn write_hp_fields(&mut self) {
        for port in 0..NBR_PORTS {
            let offset = self.state.hp.tx_offs[port];
            let field = self.state.hp.mdt0[port];
            let head = u32::from(field.selection) | (u32::from(field.control) << 16);
            self.write_tx_long(offset, head);
            self.write_tx_long(offset + 4, field.info);
        }
    }

    /// Read back the AT0 hot-plug fields of both ports.
    pub(crate) fn cyclic_hot_plug_at(&mut self) {
        if !self.state.hp.enabled || self.state.hp.phase == HotPlugPhase::None {
            return;
        }
        let rx_buf = self.state.redundancy.rx_buffer;
        for port in 0..NBR_PORTS {
            let offset = self.state.rx_at_offs[port][rx_buf[port]][0];
            let head = self.read_rx_long(offset);
            let info = self.read_rx_long(offset + 4);
            self.state.hp.at0[port] = HotPlugField {
                selection: (head & 0xFFFF) as u16,
                control: (head >> 16) as u16,
                info,
            };
        }
    }

    /// Clear the cross-communication data in both port-relative Tx
    /// buffers, done once on entry into CP4.
    pub(crate) fn clear_tx_cc_data(&mut self) {
        let len = u32::from(self.state.tx_prel_len);
        if len == 0 {
            return;
        }
        for port in 0..NBR_PORTS {
            let offset = self.state.tx_prel_offs[port];
            self.fill_tx_ram(offset, len);
        }
    }

    // --- hot plug field access for the external protocol machine -------

    pub fn set_hot_plug_phase(&mut self, phase: HotPlugPhase) {
        self.state.hp.phase = phase;
    }

    pub fn set_hot_plug_active(&mut self, active: bool) {
        self.state.hp.active = active;
    }

    /// Set the outbound MDT0 hot-plug field of one port.
    pub fn set_hot_plug_field_mdt0(&mut self, port: Port, field: HotPlugField) {
        self.state.hp.mdt0[port.index()] = field;
    }

    pub fn hot_plug_field_mdt0(&self, port: Port) -> HotPlugField {
        self.state.hp.mdt0[port.index()]
    }

    /// AT0 hot-plug field of one port as read back this cycle.
    pub fn hot_plug_field_at0(&self, port: Port) -> HotPlugField {
        self.state.hp.at0[port.index()]
    }

    /// Received AT payload mirror of CP0/CP1 (topology scan data).
    pub fn at_copy(&self, port: Port, telegram: usize) -> &[u8] {
        &self.state.at_copy[port.index()][telegram]
    }

    // --- telegram RAM access, through the DMA mirror when active -------

    pub(crate) fn read_rx_word(&self, offset: u32) -> u16 {
        if self.dma.active {
            self.dma.read_rx_u16(offset)
        } else {
            self.hal.read_rx_u16(offset)
        }
    }

    pub(crate) fn read_rx_long(&self, offset: u32) -> u32 {
        if self.dma.active {
            self.dma.read_rx_u32(offset)
        } else {
            self.hal.read_rx_u32(offset)
        }
    }

    pub(crate) fn read_rx_buffer(&self, offset: u32, dst: &mut [u8]) {
        if self.dma.active {
            self.dma.read_rx_block(offset, dst);
        } else {
            self.hal.read_rx_block(offset, dst);
        }
    }

    pub(crate) fn write_tx_word(&mut self, offset: u32, value: u16) {
        if self.dma.active {
            self.dma.write_tx_u16(offset, value);
        } else {
            self.hal.write_tx_u16(offset, value);
        }
    }

    pub(crate) fn write_tx_long(&mut self, offset: u32, value: u32) {
        if self.dma.active {
            self.dma.write_tx_u32(offset, value);
        } else {
            self.hal.write_tx_u32(offset, value);
        }
    }

    pub(crate) fn write_tx_buffer(&mut self, offset: u32, src: &[u8]) {
        if self.dma.active {
            self.dma.write_tx_block(offset, src);
        } else {
            self.hal.write_tx_block(offset, src);
        }
    }

    pub(crate) fn fill_tx_ram(&mut self, offset: u32, len: u32) {
        if self.dma.active {
            self.dma.fill_tx(offset, len);
        } else {
            self.hal.fill_tx(offset, len, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigGraph;
    use crate::master::{Master, Options};
    use crate::sim::SoftFpga;

    fn ready_tgsr() -> u32 {
        (Tgsr::LINK | Tgsr::MST_VALID).bits()
    }

    fn master_in_cp1(addresses: &[u16]) -> Master<SoftFpga> {
        let mut master =
            Master::open(SoftFpga::new(), ConfigGraph::default(), Options::default()).unwrap();
        master.project_slaves(addresses).unwrap();
        master.set_phase(Phase::Cp0).unwrap();
        master.set_phase(Phase::Cp1).unwrap();
        master.hal_mut().set_telegram_status(Port::Port1, ready_tgsr());
        master.hal_mut().set_telegram_status(Port::Port2, ready_tgsr());
        master
    }

    fn set_s_dev(master: &mut Master<SoftFpga>, slave: usize, port: usize, value: u16) {
        let offset = master.state.s_dev_offs[slave][port][0];
        master.hal_mut().write_rx_u16(offset, value);
    }

    /// AT0 valid on both ports
    fn all_valid(master: &mut Master<SoftFpga>) {
        master
            .hal_mut()
            .set_valid_telegrams(0x0010 | (0x0010 << 16));
    }

    #[test]
    fn test_monitoring_gate() {
        let mut master = master_in_cp1(&[2]);
        master.set_monitoring_mode(MonitoringMode::Off);
        assert_eq!(master.cyclic_handling(), CyclicResult::Ok);
        // nothing was requested from the buffer system
        assert_eq!(master.hal().rx_buffer_requests, 0);
    }

    #[test]
    fn test_device_control_copied_for_active_slaves() {
        let mut master = master_in_cp1(&[2, 3]);
        all_valid(&mut master);
        set_s_dev(&mut master, 0, 0, S_DEV_SLAVE_VALID);
        set_s_dev(&mut master, 1, 0, S_DEV_SLAVE_VALID);
        master.set_device_control(0, 0xAA01);
        master.set_device_control(1, 0xBB02);
        master.cyclic_handling();
        let d0 = master.state.c_dev_offs[0][0];
        let d1 = master.state.c_dev_offs[1][0];
        assert_eq!(master.hal().read_tx_u16(d0), 0xAA01);
        assert_eq!(master.hal().read_tx_u16(d1), 0xBB02);
    }

    #[test]
    fn test_preferred_port_switch_and_back() {
        let mut master = master_in_cp1(&[2]);
        // AT0 valid only on port 2, slave valid there
        master.hal_mut().set_valid_telegrams(0x0010 << 16);
        set_s_dev(&mut master, 0, 1, S_DEV_SLAVE_VALID | 5);
        master.cyclic_handling();
        assert_eq!(master.preferred_port(0), Port::Port2);
        assert_eq!(master.device_status(0).s_dev, S_DEV_SLAVE_VALID | 5);
        assert_eq!(master.device_status(0).miss, 0);

        // back: valid only on port 1
        master.hal_mut().set_valid_telegrams(0x0010);
        set_s_dev(&mut master, 0, 0, S_DEV_SLAVE_VALID | 7);
        master.cyclic_handling();
        assert_eq!(master.preferred_port(0), Port::Port1);
        assert_eq!(master.device_status(0).s_dev, S_DEV_SLAVE_VALID | 7);
    }

    #[test]
    fn test_slave_removed_after_threshold() {
        let mut master = master_in_cp1(&[2, 3, 4]);
        master.config.timing.allowed_slave_valid_miss = 2;
        all_valid(&mut master);
        for slave in 0..3 {
            set_s_dev(&mut master, slave, 0, S_DEV_SLAVE_VALID);
        }
        master.cyclic_handling();
        assert_eq!(master.device_status(1).miss, 0);

        // slave 3 (index 1) stops answering on both ports
        set_s_dev(&mut master, 1, 0, 0);
        set_s_dev(&mut master, 1, 1, 0);
        master.cyclic_handling();
        assert_eq!(master.device_status(1).miss, 1);
        master.cyclic_handling();
        assert_eq!(master.device_status(1).miss, 2);
        assert_eq!(master.activity(1), Activity::Active);
        master.cyclic_handling();
        // third miss exceeds the threshold of 2
        assert_eq!(master.device_status(1).miss, 3);
        assert_eq!(master.activity(1), Activity::Inactive);
        // slave 3 and everything behind it left the port 1 scan list
        assert_eq!(master.state.scan_p1.addresses, vec![0, 2]);
        assert_eq!(master.state.last_addr_p1, 2);
        assert!(master.slaves.deactivated.contains(&3));
    }

    #[test]
    fn test_at_miss_counts_whole_range() {
        let mut master = master_in_cp1(&[2, 3]);
        master.config.timing.allowed_slave_valid_miss = 5;
        // no AT received at all
        master.hal_mut().set_valid_telegrams(0);
        master.cyclic_handling();
        assert_eq!(master.device_status(0).miss, 1);
        assert_eq!(master.device_status(1).miss, 1);
        assert_eq!(master.device_status(0).s_dev, 0);
    }

    #[test]
    fn test_check_topology_results() {
        let mut master = master_in_cp1(&[2]);
        all_valid(&mut master);
        set_s_dev(&mut master, 0, 0, S_DEV_SLAVE_VALID);

        // no link on either port
        master.hal_mut().set_telegram_status(Port::Port1, 0);
        master.hal_mut().set_telegram_status(Port::Port2, 0);
        assert_eq!(master.cyclic_handling(), CyclicResult::NoLinkAttached);

        // link but no MST
        master
            .hal_mut()
            .set_telegram_status(Port::Port1, Tgsr::LINK.bits());
        assert_eq!(master.cyclic_handling(), CyclicResult::NoTelegramsReceived);

        // link, no MST, miss latched
        master
            .hal_mut()
            .set_telegram_status(Port::Port1, (Tgsr::LINK | Tgsr::MST_MISS).bits());
        assert_eq!(master.cyclic_handling(), CyclicResult::MstMiss);

        // valid MST reappearing counts as a topology change first
        master.hal_mut().set_telegram_status(Port::Port1, ready_tgsr());
        assert_eq!(master.cyclic_handling(), CyclicResult::TopologyChange);
        master.hal_mut().set_telegram_status(Port::Port1, ready_tgsr());
        assert_eq!(master.cyclic_handling(), CyclicResult::Ok);

        // window error
        master
            .hal_mut()
            .set_telegram_status(Port::Port1, ready_tgsr() | Tgsr::MST_WIN_ERR.bits());
        assert_eq!(master.cyclic_handling(), CyclicResult::MstWindowError);
    }

    #[test]
    fn test_cp0_copies_at_mirror() {
        let mut master =
            Master::open(SoftFpga::new(), ConfigGraph::default(), Options::default()).unwrap();
        master.project_slaves(&[2]).unwrap();
        master.set_phase(Phase::Cp0).unwrap();
        master.hal_mut().set_telegram_status(Port::Port1, ready_tgsr());
        master.hal_mut().set_telegram_status(Port::Port2, ready_tgsr());
        // topology address of a slave in the port 1 AT0 image
        let base = master.state.rx_at_offs[0][0][0];
        master.hal_mut().write_rx_u16(base + 4, 0x0102);
        master.cyclic_handling();
        let copy = master.at_copy(Port::Port1, 0);
        assert_eq!(copy[4], 0x02);
        assert_eq!(copy[5], 0x01);
    }

    #[test]
    fn test_hot_plug_warmup_sequence() {
        let mut master = master_in_cp1(&[2]);
        master.set_phase(Phase::Cp2).unwrap();
        master.config.timing.t6_uc_begin = 0x1111_2222;
        master.config.timing.t7_uc_end = 0x3333_4444;
        master.set_phase(Phase::Cp3).unwrap();
        master.hal_mut().set_telegram_status(Port::Port1, ready_tgsr());
        master.hal_mut().set_telegram_status(Port::Port2, ready_tgsr());
        all_valid(&mut master);
        set_s_dev(&mut master, 0, 0, S_DEV_SLAVE_VALID);

        // first cycle broadcasts t6
        master.cyclic_handling();
        let hp_off = master.state.hp.tx_offs[0];
        assert_eq!(
            master.hal().read_tx_u16(hp_off),
            HP_ADD_BRDCST_ADD
        );
        assert_eq!(master.hal().read_tx_u16(hp_off + 2) & HP_CNTRL_PAR_CODING_MASK, HP_CODE_T6);

        // run into the t7 window
        for _ in 0..HP_CP3_REPEAT_RATE_T6_T7 {
            master.cyclic_handling();
        }
        assert_eq!(master.hal().read_tx_u16(hp_off + 2) & HP_CNTRL_PAR_CODING_MASK, HP_CODE_T7);

        // past the warm-up the field resets to defaults
        for _ in 0..HP_CP3_REPEAT_RATE_T6_T7 {
            master.cyclic_handling();
        }
        assert_eq!(master.hal().read_tx_u16(hp_off), HP_ADD_DEFAULT_SADD);
        assert_eq!(master.hal().read_tx_u16(hp_off + 2) & HP_CNTRL_PAR_CODING_MASK, 0);
    }
}
