// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Configuration graph: real-time connections, the S-0-1050 setups shared
//! by their participants, real-time bit bindings, slave setup parameter
//! lists, the projected slave list and the telegram timing.

use super::constant::*;
use super::error::Error;
use arrayvec::ArrayVec;

/// unused slot / "no entry" marker in all index fields
pub const EMPTY: u16 = 0xFFFF;

/// A real-time connection (S-0-1050 structure instance attributes that are
/// shared by all participants).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// S-0-1050.x.2, connection number; 0 while unused
    pub number: u16,
    /// S-0-1050.x.3, telegram assignment: telegram number and byte offset
    pub telegram_assignment: u16,
    /// S-0-1050.x.5, connection length in bytes including C-CON
    pub length: u16,
    /// S-0-1050.x.10, connection cycle time [ns]
    pub cycle_time: u32,
    /// S-0-1050.x.11, allowed consecutive data losses
    pub allowed_losses: u16,
    /// 16-bit tag for bulk filtering in the binary configuration
    pub application_id: u16,
    pub telegram_type: TelegramType,
    pub name: [u8; CONN_NAME_LENGTH],
}

impl Default for Connection {
    fn default() -> Self {
        Connection {
            number: 0,
            telegram_assignment: 0,
            length: 0,
            cycle_time: 0,
            allowed_losses: 0,
            application_id: 0,
            telegram_type: TelegramType::Mdt,
            name: [0; CONN_NAME_LENGTH],
        }
    }
}

impl Connection {
    /// telegram number 0..3 from the assignment word
    pub fn tel_nbr(&self) -> usize {
        ((self.telegram_assignment & S_1050_SE3_TEL_NBR_MASK) >> S_1050_SE3_TEL_NBR_SHIFT) as usize
    }

    /// byte offset inside the telegram data field
    pub fn tel_offset(&self) -> u16 {
        self.telegram_assignment & S_1050_SE3_TEL_OFFSET_MASK
    }

    pub fn set_assignment(&mut self, tel_nbr: u16, offset: u16) {
        self.telegram_assignment =
            ((tel_nbr << S_1050_SE3_TEL_NBR_SHIFT) & S_1050_SE3_TEL_NBR_MASK)
                | (offset & S_1050_SE3_TEL_OFFSET_MASK);
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(CONN_NAME_LENGTH);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = [0; CONN_NAME_LENGTH];
        let n = name.len().min(CONN_NAME_LENGTH);
        self.name[..n].copy_from_slice(&name.as_bytes()[..n]);
    }
}

/// One S-0-1050 sub-element-1 setup: the per-participant view on a
/// connection (role, monitoring, capability, payload IDN list).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    /// S-0-1050.x.1 connection setup word
    pub setup: u16,
    /// S-0-1050.x.7 connection capability
    pub capability: u16,
    /// S-0-1050.x.6 configured IDN list
    pub idns: ArrayVec<u32, MAX_IDN_PER_CONNECTION>,
}

impl Configuration {
    pub fn is_active(&self) -> bool {
        self.setup & S_1050_SE1_ACTIVE != 0
    }

    pub fn is_active_producer(&self) -> bool {
        self.setup & S_1050_SE1_ACTIVE_TYPE_MASK == S_1050_SE1_ACTIVE_PRODUCER
    }

    pub fn is_active_consumer(&self) -> bool {
        self.setup & S_1050_SE1_ACTIVE_TYPE_MASK == S_1050_SE1_ACTIVE_CONSUMER
    }

    /// monitoring type bits of the setup word
    pub fn monitoring(&self) -> u16 {
        self.setup & S_1050_SE1_MONITOR_MASK
    }
}

/// Real-time bit binding: up to 4 (IDN, bit) pairs mapped into the
/// real-time bits of the connection control word (S-0-1050.x.20/21).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtBitsConfig {
    pub idns: [u32; MAX_RT_BITS_PER_CONN],
    pub bit_in_idn: [u16; MAX_RT_BITS_PER_CONN],
}

/// One connection instance slot of the master or of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnSlot {
    pub conn_idx: u16,
    pub config_idx: u16,
    pub rt_bits_idx: u16,
}

impl Default for ConnSlot {
    fn default() -> Self {
        ConnSlot {
            conn_idx: EMPTY,
            config_idx: EMPTY,
            rt_bits_idx: EMPTY,
        }
    }
}

impl ConnSlot {
    pub fn is_used(&self) -> bool {
        self.conn_idx != EMPTY
    }

    pub fn clear(&mut self) {
        *self = ConnSlot::default();
    }
}

/// Connection instances of the master.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub slots: [ConnSlot; MAX_CONN_MASTER],
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            slots: [ConnSlot::default(); MAX_CONN_MASTER],
        }
    }
}

/// Per-slave telegram placement: device word and SVC container offsets.
/// Telegram number in the upper nibble, byte offset in the lower 12 bits
/// (S-0-1009 / S-0-1011 / S-0-1013 coding).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlaveTelegramConfig {
    pub c_dev_offset: u16,
    pub s_dev_offset: u16,
    pub svc_offset: u16,
}

pub fn dev_offset(tel: u16, offset: u16) -> u16 {
    ((tel << DEV_OFFSET_TEL_SHIFT) & DEV_OFFSET_TEL_MASK) | (offset & DEV_OFFSET_MASK)
}

/// Connection instances and telegram placement of one projected slave.
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub slots: [ConnSlot; MAX_CONN_PER_SLAVE],
    pub telegram: SlaveTelegramConfig,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        SlaveConfig {
            slots: [ConnSlot::default(); MAX_CONN_PER_SLAVE],
            telegram: SlaveTelegramConfig::default(),
        }
    }
}

/// One slave setup parameter: an IDN with raw data applied by the
/// (external) parameter subsystem during phase progression.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetupParameter {
    pub idn: u32,
    pub data: Vec<u8>,
}

/// Named list of setup parameters, reference-counted by slave setups.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetupParamsList {
    pub application_id: u16,
    pub params: ArrayVec<u16, MAX_PARAMS_PER_LIST>,
}

/// Binding of a setup parameter list to one slave (by Sercos address) or
/// to the master (address 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveSetup {
    pub slave_address: u16,
    pub list_idx: u16,
}

impl Default for SlaveSetup {
    fn default() -> Self {
        SlaveSetup {
            slave_address: EMPTY,
            list_idx: EMPTY,
        }
    }
}

impl SlaveSetup {
    pub fn is_used(&self) -> bool {
        self.list_idx != EMPTY
    }
}

/// Communication timing shared by the layout builder and the cyclic
/// engine. The data-field lengths are the S-0-1010 / S-0-1012 values.
#[derive(Debug, Clone)]
pub struct Timing {
    /// communication cycle time [ns], 250_000..=65_000_000
    pub cycle_time_ns: u32,
    pub mdt_length: [u16; MAX_TEL],
    pub at_length: [u16; MAX_TEL],
    /// tolerated consecutive misses of slave valid before removal
    pub allowed_slave_valid_miss: u16,
    pub svc_busy_timeout: u16,
    pub svc_handshake_timeout: u16,
    /// S-0-1017: begin of the UC channel window (t6)
    pub t6_uc_begin: u32,
    /// S-0-1017: end of the UC channel window (t7)
    pub t7_uc_end: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            cycle_time_ns: 1_000_000,
            mdt_length: [0; MAX_TEL],
            at_length: [0; MAX_TEL],
            allowed_slave_valid_miss: 1,
            svc_busy_timeout: 50,
            svc_handshake_timeout: 10,
            t6_uc_begin: 0,
            t7_uc_end: 0,
        }
    }
}

/// Projected and deactivated slaves plus the parser-temporary address
/// list used while decoding a configuration before the scan.
#[derive(Debug, Clone, Default)]
pub struct SlaveList {
    /// Sercos addresses by slave index (projected order)
    pub proj: Vec<u16>,
    /// addresses removed from projection but kept for re-scan
    pub deactivated: Vec<u16>,
    /// addresses adopted from a binary configuration before projection
    pub parser_temp: Vec<u16>,
    /// address -> slave index, EMPTY when not projected
    proj_idx: Vec<u16>,
    parser_temp_idx: Vec<u16>,
}

impl SlaveList {
    pub fn new() -> SlaveList {
        SlaveList {
            proj: Vec::new(),
            deactivated: Vec::new(),
            parser_temp: Vec::new(),
            proj_idx: vec![EMPTY; MAX_SLAVE_ADD as usize + 1],
            parser_temp_idx: vec![EMPTY; MAX_SLAVE_ADD as usize + 1],
        }
    }

    pub fn num_proj_slaves(&self) -> usize {
        self.proj.len()
    }

    /// true once the projected list has been established by the scan
    pub fn is_projected(&self) -> bool {
        !self.proj.is_empty()
    }

    pub fn project(&mut self, addresses: &[u16]) -> Result<(), Error> {
        self.proj.clear();
        for idx in self.proj_idx.iter_mut() {
            *idx = EMPTY;
        }
        for (i, &add) in addresses.iter().enumerate() {
            if add == 0 || add > MAX_SLAVE_ADD || self.proj_idx[add as usize] != EMPTY {
                return Err(Error::WrongSlaveAddress(add));
            }
            self.proj.push(add);
            self.proj_idx[add as usize] = i as u16;
        }
        Ok(())
    }

    pub fn index_of(&self, address: u16) -> Option<usize> {
        if address == 0 || address > MAX_SLAVE_ADD {
            return None;
        }
        match self.proj_idx[address as usize] {
            EMPTY => None,
            idx => Some(idx as usize),
        }
    }

    pub fn is_deactivated(&self, address: u16) -> bool {
        self.deactivated.contains(&address)
    }

    /// Index of an address in the parser-temporary list, adding it when
    /// unknown. Used while decoding into an unprojected instance.
    pub fn temp_index_of(&mut self, address: u16) -> Result<usize, Error> {
        if address == 0 || address > MAX_SLAVE_ADD {
            return Err(Error::WrongSlaveAddress(address));
        }
        match self.parser_temp_idx[address as usize] {
            EMPTY => {
                let idx = self.parser_temp.len();
                if idx >= MAX_SLAVES {
                    return Err(Error::WrongSlaveAddress(address));
                }
                self.parser_temp.push(address);
                self.parser_temp_idx[address as usize] = idx as u16;
                Ok(idx)
            }
            idx => Ok(idx as usize),
        }
    }

    pub fn clear_parser_temp(&mut self) {
        self.parser_temp.clear();
        for idx in self.parser_temp_idx.iter_mut() {
            *idx = EMPTY;
        }
    }
}

/// Topology scan list of one master port: position 0 is the master
/// itself, the slaves follow in ring order.
#[derive(Debug, Clone, Default)]
pub struct ScanList {
    pub addresses: Vec<u16>,
}

impl ScanList {
    pub fn from_addresses(addresses: &[u16]) -> ScanList {
        let mut list = ScanList {
            addresses: Vec::with_capacity(addresses.len() + 1),
        };
        list.addresses.push(0);
        list.addresses.extend_from_slice(addresses);
        list
    }

    pub fn last_address(&self) -> u16 {
        *self.addresses.last().unwrap_or(&0)
    }
}

/// Public device status of one slave: the S-DEV word of the current
/// cycle and the consecutive slave-valid miss counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub s_dev: u16,
    pub miss: u16,
}

/// Derived usage markers over the configuration graph: an entry is in use
/// exactly when an instance slot (or setup chain) references it.
#[derive(Debug, Clone)]
pub struct UsedMarkers {
    pub conn: Vec<bool>,
    pub conn_nbr: Vec<bool>,
    pub config: Vec<bool>,
    pub rt_bits: Vec<bool>,
    pub setup_list: Vec<bool>,
    pub setup_param: Vec<bool>,
}

/// The configuration graph of one master instance.
#[derive(Debug, Clone)]
pub struct ConfigGraph {
    pub connections: Vec<Connection>,
    pub configurations: Vec<Configuration>,
    pub rt_bits: Vec<RtBitsConfig>,
    pub master: MasterConfig,
    pub slaves: Vec<SlaveConfig>,
    pub setup_lists: Vec<SetupParamsList>,
    pub setup_params: Vec<SetupParameter>,
    pub slave_setups: Vec<SlaveSetup>,
    pub timing: Timing,
}

impl Default for ConfigGraph {
    fn default() -> Self {
        ConfigGraph {
            connections: vec![Connection::default(); MAX_GLOB_CONN],
            configurations: vec![Configuration::default(); MAX_GLOB_CONFIG],
            rt_bits: vec![RtBitsConfig::default(); MAX_RT_BIT_CONFIG],
            master: MasterConfig::default(),
            slaves: vec![SlaveConfig::default(); MAX_SLAVES],
            setup_lists: vec![SetupParamsList::default(); MAX_SETUP_PARAMS_LIST],
            setup_params: vec![SetupParameter::default(); MAX_SETUP_PARAMETER],
            slave_setups: vec![SlaveSetup::default(); MAX_SLAVE_SETUP],
            timing: Timing::default(),
        }
    }
}

impl ConfigGraph {
    /// Derive the usage markers from the instance slots, the way both the
    /// codec and the layout builder see the graph.
    pub fn used_markers(&self, num_slaves: usize) -> UsedMarkers {
        let mut used = UsedMarkers {
            conn: vec![false; MAX_GLOB_CONN],
            conn_nbr: vec![false; MAX_GLOB_CONN],
            config: vec![false; MAX_GLOB_CONFIG],
            rt_bits: vec![false; MAX_RT_BIT_CONFIG],
            setup_list: vec![false; MAX_SETUP_PARAMS_LIST],
            setup_param: vec![false; MAX_SETUP_PARAMETER],
        };
        let mut mark_slot = |slot: &ConnSlot, used: &mut UsedMarkers| {
            if !slot.is_used() {
                return;
            }
            used.conn[slot.conn_idx as usize] = true;
            let nbr = self.connections[slot.conn_idx as usize].number as usize;
            if nbr > 0 && nbr <= MAX_GLOB_CONN {
                used.conn_nbr[nbr - 1] = true;
            }
            if slot.config_idx != EMPTY {
                used.config[slot.config_idx as usize] = true;
            }
            if slot.rt_bits_idx != EMPTY {
                used.rt_bits[slot.rt_bits_idx as usize] = true;
            }
        };
        for slot in self.master.slots.iter() {
            mark_slot(slot, &mut used);
        }
        for slave in self.slaves.iter().take(num_slaves) {
            for slot in slave.slots.iter() {
                mark_slot(slot, &mut used);
            }
        }
        for setup in self.slave_setups.iter().filter(|s| s.is_used()) {
            let list_idx = setup.list_idx as usize;
            if list_idx < self.setup_lists.len() {
                used.setup_list[list_idx] = true;
                for &p in self.setup_lists[list_idx].params.iter() {
                    if (p as usize) < used.setup_param.len() {
                        used.setup_param[p as usize] = true;
                    }
                }
            }
        }
        used
    }

    /// Locate the producer participant (slave index, or `None` for the
    /// master) of a connection.
    pub fn producer_of(&self, conn_idx: u16, num_slaves: usize) -> Option<ProducerId> {
        for slot in self.master.slots.iter() {
            if slot.conn_idx == conn_idx
                && self.configurations[slot.config_idx as usize].is_active_producer()
            {
                return Some(ProducerId::Master);
            }
        }
        for (s, slave) in self.slaves.iter().enumerate().take(num_slaves) {
            for slot in slave.slots.iter() {
                if slot.conn_idx == conn_idx
                    && self.configurations[slot.config_idx as usize].is_active_producer()
                {
                    return Some(ProducerId::Slave(s as u16));
                }
            }
        }
        None
    }
}

/// Producer identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerId {
    Master,
    Slave(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telegram_assignment() {
        let mut conn = Connection::default();
        conn.set_assignment(2, 0x123);
        assert_eq!(conn.tel_nbr(), 2);
        assert_eq!(conn.tel_offset(), 0x123);
    }

    #[test]
    fn test_connection_name_roundtrip() {
        let mut conn = Connection::default();
        conn.set_name("axis 1 target position");
        assert_eq!(conn.name_str(), "axis 1 target position");
    }

    #[test]
    fn test_slave_list_projection() {
        let mut list = SlaveList::new();
        list.project(&[3, 5, 17]).unwrap();
        assert_eq!(list.num_proj_slaves(), 3);
        assert_eq!(list.index_of(5), Some(1));
        assert_eq!(list.index_of(4), None);
        // duplicate address rejected
        assert_eq!(
            list.project(&[3, 3]),
            Err(Error::WrongSlaveAddress(3))
        );
    }

    #[test]
    fn test_parser_temp_addresses() {
        let mut list = SlaveList::new();
        assert_eq!(list.temp_index_of(9).unwrap(), 0);
        assert_eq!(list.temp_index_of(4).unwrap(), 1);
        assert_eq!(list.temp_index_of(9).unwrap(), 0);
        assert!(list.temp_index_of(0).is_err());
    }

    #[test]
    fn test_used_markers_follow_slots() {
        let mut graph = ConfigGraph::default();
        graph.configurations[2].setup = S_1050_SE1_ACTIVE_PRODUCER;
        graph.master.slots[0] = ConnSlot {
            conn_idx: 7,
            config_idx: 2,
            rt_bits_idx: EMPTY,
        };
        graph.connections[7].number = 1;
        let used = graph.used_markers(0);
        assert!(used.conn[7]);
        assert!(used.config[2]);
        assert!(used.conn_nbr[0]);
        assert!(!used.conn[6]);
        assert_eq!(graph.producer_of(7, 0), Some(ProducerId::Master));
    }
}
