// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Binary connection-configuration codec: a length-prefixed, little-
//! endian, 4-byte-aligned stream of fixed-header tables transporting the
//! configuration graph (connections, producers, consumer lists,
//! consumers, configurations, real-time bits and the optional slave
//! setup parameter tables).

use super::config::{
    ConnSlot, Connection, ProducerId, SetupParameter, SetupParamsList, SlaveSetup, UsedMarkers,
    EMPTY,
};
use super::constant::*;
use super::error::Error;
use super::hal::Hal;
use super::master::Master;
use byteorder::{ByteOrder, LittleEndian};

pub const BIN_CONFIG_VERSION_01_01: u16 = 0x0101;
/// application ID 0 selects every connection
pub const UNIVERSAL_APP_ID: u16 = 0;

const LIST_HEADER_LEN: u16 = 12; // magic + version
const MAGIC: &[u8; 10] = b"CSMCfg_bin";
const END_SIGN: &[u8; 4] = b"~^~^";
const FILE_END: &[u8; 4] = b"eNDE";
const T_CNNC: &[u8; 4] = b"Cnnc";
const T_PRDC: &[u8; 4] = b"Prdc";
const T_CNLS: &[u8; 4] = b"CnLs";
const T_CNSM: &[u8; 4] = b"Cnsm";
const T_CNFG: &[u8; 4] = b"Cnfg";
const T_RTBT: &[u8; 4] = b"RTBt";
const T_SLST: &[u8; 4] = b"SlSt";
const T_STPL: &[u8; 4] = b"StPL";
const T_PRMT: &[u8; 4] = b"Prmt";

const CONN_RECORD_LEN: usize = 14 + CONN_NAME_LENGTH;
const PROD_RECORD_LEN: usize = 16;
const CONS_RECORD_LEN: usize = 16;

const TABLE_DUMMY: u16 = 0x4241; // "AB"
/// producer-table dummy marking a master-produced AT connection
const MASTER_PROD_AT: u16 = 0x4343; // "CC"

/// reserve key 0 for "not present"
const PREVENT_NULL: u16 = 1;

/// Decode behavior switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// assign fresh connection numbers instead of taking them from the file
    pub auto_conn_numbers: bool,
    /// put connections into the first free instance slot instead of the
    /// instance recorded in the file
    pub auto_instances: bool,
}

/// participant key of a slave connection instance
fn slave_key(slave_idx: usize, instance: usize) -> u16 {
    (slave_idx * MAX_CONN_PER_SLAVE + instance) as u16 + PREVENT_NULL
}

/// participant key of a master connection instance
fn master_key(instance: usize) -> u16 {
    (MAX_CONN_PER_SLAVE * MAX_SLAVES + instance) as u16 + PREVENT_NULL
}

fn is_master_key(key: u16) -> bool {
    usize::from(key) > MAX_CONN_PER_SLAVE * MAX_SLAVES
}

// ---------------------------------------------------------------------------
// encode
// ---------------------------------------------------------------------------

/// Incremental little-endian writer with the allowed-length check of the
/// list format: the tracked length covers magic, version and tables; the
/// leading length words are excluded.
struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
    len: u16,
    cap: u32,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8], cap: u32) -> Writer<'a> {
        Writer {
            buf,
            pos: 4,
            len: 0,
            cap,
        }
    }

    fn ensure(&mut self, add: usize) -> Result<(), Error> {
        if u32::from(self.len) + add as u32 > self.cap || self.pos + add > self.buf.len() {
            return Err(Error::BufferTooSmall);
        }
        Ok(())
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.ensure(bytes.len())?;
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        self.len += bytes.len() as u16;
        Ok(())
    }

    fn put_u16(&mut self, value: u16) -> Result<(), Error> {
        self.ensure(2)?;
        LittleEndian::write_u16(&mut self.buf[self.pos..], value);
        self.pos += 2;
        self.len += 2;
        Ok(())
    }

    fn put_u32(&mut self, value: u32) -> Result<(), Error> {
        self.ensure(4)?;
        LittleEndian::write_u32(&mut self.buf[self.pos..], value);
        self.pos += 4;
        self.len += 4;
        Ok(())
    }

    fn table_header(&mut self, magic: &[u8; 4]) -> Result<(), Error> {
        self.put_bytes(END_SIGN)?;
        self.put_bytes(magic)
    }
}

/// producer and consumer participant keys of one connection
#[derive(Debug, Clone, Default)]
struct Participants {
    producer: u16,
    consumers: Vec<u16>,
}

impl<H: Hal> Master<H> {
    fn slave_count_for_config(&self) -> usize {
        if self.slaves.is_projected() {
            self.slaves.num_proj_slaves()
        } else {
            self.slaves.parser_temp.len()
        }
    }

    fn config_address_of(&self, slave_idx: usize) -> u16 {
        if self.slaves.is_projected() {
            self.slaves.proj[slave_idx]
        } else {
            self.slaves.parser_temp[slave_idx]
        }
    }

    /// connection matches the application-ID filter
    fn app_id_selected(&self, conn_idx: usize, app_id: u16, positive: bool) -> bool {
        let conn_app = self.config.connections[conn_idx].application_id;
        if positive {
            app_id == UNIVERSAL_APP_ID || conn_app == app_id
        } else {
            conn_app != app_id
        }
    }

    /// Serialize the configuration graph for one application-ID filter
    /// into `target`. The first two words of `target` are the list
    /// length prefix: the actual length is written back, the maximum
    /// length is read as the allowed size (0 = unbounded).
    pub fn generate_bin_config(
        &self,
        version: u16,
        app_id: u16,
        app_id_positive: bool,
        target: &mut [u8],
    ) -> Result<(), Error> {
        if target.len() < 4 {
            return Err(Error::BufferTooSmall);
        }
        let given_max = LittleEndian::read_u16(&target[2..]);
        let cap = if given_max == 0 {
            u32::MAX
        } else {
            u32::from(given_max)
        };

        let result = self.generate_into(version, app_id, app_id_positive, target, cap);
        let actual = match &result {
            Ok(len) => *len,
            Err(_) => 0,
        };
        LittleEndian::write_u16(&mut target[0..], actual);
        if given_max == 0 {
            LittleEndian::write_u16(&mut target[2..], actual);
        }
        result.map(|_| ())
    }

    fn generate_into(
        &self,
        version: u16,
        app_id: u16,
        positive: bool,
        target: &mut [u8],
        cap: u32,
    ) -> Result<u16, Error> {
        let num_slaves = self.slave_count_for_config();
        let used = self.config.used_markers(num_slaves);

        // mark every active connection matching the filter
        let mut needed = vec![false; MAX_GLOB_CONN];
        let mut any_active = false;
        for conn_idx in 0..MAX_GLOB_CONN {
            if !used.conn[conn_idx] {
                continue;
            }
            any_active = true;
            if self.app_id_selected(conn_idx, app_id, positive) {
                needed[conn_idx] = true;
            }
        }

        // slave setup lists matching the filter
        let mut needed_lists = vec![false; MAX_SETUP_PARAMS_LIST];
        let mut found_setup = false;
        for (idx, list) in self.config.setup_lists.iter().enumerate() {
            if !used.setup_list[idx] {
                continue;
            }
            let selected = if positive {
                app_id == UNIVERSAL_APP_ID || list.application_id == app_id
            } else {
                list.application_id != app_id
            };
            if selected {
                needed_lists[idx] = true;
                found_setup = true;
            }
        }

        let found_conn = needed.iter().any(|&n| n);
        if !found_conn && !found_setup {
            if any_active {
                return Err(Error::ApplicationIdUnavailable);
            }
            // empty instance: the header alone is a valid, empty list
            let mut writer = Writer::new(target, cap);
            writer.put_bytes(MAGIC)?;
            writer.put_u16(version)?;
            return Ok(writer.len);
        }

        if version != BIN_CONFIG_VERSION_01_01 {
            return Err(Error::BinConfigVersionUnavailable);
        }

        // resolve producer and consumers of every marked connection
        let mut participants: Vec<Participants> = vec![Participants::default(); MAX_GLOB_CONN];
        for conn_idx in 0..MAX_GLOB_CONN {
            if !needed[conn_idx] {
                continue;
            }
            let parts = &mut participants[conn_idx];
            for (s, slave) in self.config.slaves.iter().enumerate().take(num_slaves) {
                for (inst, slot) in slave.slots.iter().enumerate() {
                    if slot.conn_idx != conn_idx as u16 || slot.config_idx == EMPTY {
                        continue;
                    }
                    let setup = &self.config.configurations[slot.config_idx as usize];
                    if setup.is_active_producer() {
                        if parts.producer != 0 {
                            return Err(Error::DoubleProducer);
                        }
                        parts.producer = slave_key(s, inst);
                    } else if setup.is_active_consumer() {
                        parts.consumers.push(slave_key(s, inst));
                    }
                }
            }
            for (inst, slot) in self.config.master.slots.iter().enumerate() {
                if slot.conn_idx != conn_idx as u16 || slot.config_idx == EMPTY {
                    continue;
                }
                let setup = &self.config.configurations[slot.config_idx as usize];
                if setup.is_active_producer() {
                    if parts.producer != 0 {
                        return Err(Error::DoubleProducer);
                    }
                    parts.producer = master_key(inst);
                } else if setup.is_active_consumer() {
                    parts.consumers.push(master_key(inst));
                }
            }
            if parts.producer == 0 {
                return Err(Error::NoProducer);
            }
            if parts.consumers.is_empty() {
                return Err(Error::NoConsumer);
            }
        }

        let mut writer = Writer::new(target, cap);
        writer.put_bytes(MAGIC)?;
        writer.put_u16(version)?;

        let mut used_config = vec![false; MAX_GLOB_CONFIG];
        let mut used_rtb = vec![false; MAX_RT_BIT_CONFIG];

        // connections table
        writer.put_bytes(T_CNNC)?;
        let mut cons_list_key = 1u16;
        for conn_idx in 0..MAX_GLOB_CONN {
            if !needed[conn_idx] {
                continue;
            }
            let conn = &self.config.connections[conn_idx];
            writer.put_u16(conn_idx as u16)?; // connection key
            writer.put_u16(conn.number)?;
            writer.put_u16(conn.telegram_assignment)?;
            writer.put_u16(conn.length)?;
            writer.put_u16(conn.application_id)?;
            writer.put_bytes(&conn.name)?;
            writer.put_u16(participants[conn_idx].producer)?;
            writer.put_u16(cons_list_key)?;
            cons_list_key += 1;
        }

        // producers table
        writer.table_header(T_PRDC)?;
        for conn_idx in 0..MAX_GLOB_CONN {
            if !needed[conn_idx] {
                continue;
            }
            let key = participants[conn_idx].producer;
            let conn = &self.config.connections[conn_idx];
            let (address, instance, slot) = self.participant_slot(key);
            writer.put_u16(key)?;
            writer.put_u16(address)?;
            writer.put_u32(conn.cycle_time)?;
            writer.put_u16(instance)?;
            let dummy = if address == 0 && conn.telegram_type == TelegramType::At {
                MASTER_PROD_AT
            } else {
                TABLE_DUMMY
            };
            writer.put_u16(dummy)?;
            writer.put_u16(slot.config_idx + PREVENT_NULL)?;
            used_config[slot.config_idx as usize] = true;
            if slot.rt_bits_idx == EMPTY {
                writer.put_u16(EMPTY)?;
            } else {
                writer.put_u16(slot.rt_bits_idx + PREVENT_NULL)?;
                used_rtb[slot.rt_bits_idx as usize] = true;
            }
        }

        // consumer list table
        writer.table_header(T_CNLS)?;
        let mut list_key = 1u16;
        for conn_idx in 0..MAX_GLOB_CONN {
            if !needed[conn_idx] {
                continue;
            }
            let consumers = &participants[conn_idx].consumers;
            writer.put_u16(list_key)?;
            list_key += 1;
            writer.put_u16(consumers.len() as u16)?;
            for &key in consumers.iter() {
                writer.put_u16(key)?;
            }
            if consumers.len() % 2 == 1 {
                writer.put_u16(TABLE_DUMMY)?;
            }
        }

        // consumers table
        writer.table_header(T_CNSM)?;
        for conn_idx in 0..MAX_GLOB_CONN {
            if !needed[conn_idx] {
                continue;
            }
            let conn = &self.config.connections[conn_idx];
            for &key in participants[conn_idx].consumers.iter() {
                let (address, instance, slot) = self.participant_slot(key);
                writer.put_u16(key)?;
                writer.put_u16(address)?;
                writer.put_u32(conn.cycle_time)?;
                writer.put_u16(instance)?;
                writer.put_u16(conn.allowed_losses)?;
                writer.put_u16(slot.config_idx + PREVENT_NULL)?;
                used_config[slot.config_idx as usize] = true;
                if slot.rt_bits_idx == EMPTY {
                    writer.put_u16(EMPTY)?;
                } else {
                    writer.put_u16(slot.rt_bits_idx + PREVENT_NULL)?;
                    used_rtb[slot.rt_bits_idx as usize] = true;
                }
            }
        }

        // configurations table
        writer.table_header(T_CNFG)?;
        for (idx, used) in used_config.iter().enumerate() {
            if !used {
                continue;
            }
            let config = &self.config.configurations[idx];
            writer.put_u16(idx as u16 + PREVENT_NULL)?;
            writer.put_u16(config.setup)?;
            writer.put_u16(config.capability)?;
            writer.put_u16(config.idns.len() as u16)?;
            for &idn in config.idns.iter() {
                writer.put_u32(idn)?;
            }
        }

        // real-time bits table
        writer.table_header(T_RTBT)?;
        for (idx, used) in used_rtb.iter().enumerate() {
            if !used {
                continue;
            }
            let rtb = &self.config.rt_bits[idx];
            writer.put_u16(idx as u16 + PREVENT_NULL)?;
            writer.put_u16(TABLE_DUMMY)?;
            for &idn in rtb.idns.iter() {
                writer.put_u32(idn)?;
            }
            for &bit in rtb.bit_in_idn.iter() {
                writer.put_u16(bit)?;
            }
        }

        // optional slave setup tables
        if found_setup {
            let mut used_param = vec![false; MAX_SETUP_PARAMETER];

            writer.table_header(T_SLST)?;
            for setup in self.config.slave_setups.iter() {
                if !setup.is_used() || !needed_lists[setup.list_idx as usize] {
                    continue;
                }
                writer.put_u16(setup.slave_address)?;
                writer.put_u16(setup.list_idx + PREVENT_NULL)?;
            }

            writer.table_header(T_STPL)?;
            for (idx, list) in self.config.setup_lists.iter().enumerate() {
                if !needed_lists[idx] {
                    continue;
                }
                writer.put_u16(idx as u16 + PREVENT_NULL)?;
                writer.put_u16(list.application_id)?;
                writer.put_u16(list.params.len() as u16)?;
                for &p in list.params.iter() {
                    writer.put_u16(p + PREVENT_NULL)?;
                    used_param[p as usize] = true;
                }
                // 6-byte record head: padding parity is inverted
                if list.params.len() % 2 == 0 {
                    writer.put_u16(TABLE_DUMMY)?;
                }
            }

            writer.table_header(T_PRMT)?;
            for (idx, used) in used_param.iter().enumerate() {
                if !used {
                    continue;
                }
                let param = &self.config.setup_params[idx];
                writer.put_u16(idx as u16 + PREVENT_NULL)?;
                writer.put_u16(param.data.len() as u16)?;
                writer.put_u32(param.idn)?;
                writer.put_bytes(&param.data)?;
                let pad = (4 - param.data.len() % 4) % 4;
                for _ in 0..pad {
                    writer.put_bytes(&[0])?;
                }
            }
        }

        writer.table_header(FILE_END)?;
        Ok(writer.len)
    }

    /// (Sercos address, instance, slot) of a participant key; address 0
    /// denotes the master.
    fn participant_slot(&self, key: u16) -> (u16, u16, ConnSlot) {
        if is_master_key(key) {
            let inst = usize::from(key - PREVENT_NULL) - MAX_CONN_PER_SLAVE * MAX_SLAVES;
            (0, inst as u16, self.config.master.slots[inst])
        } else {
            let raw = usize::from(key - PREVENT_NULL);
            let slave_idx = raw / MAX_CONN_PER_SLAVE;
            let inst = raw % MAX_CONN_PER_SLAVE;
            (
                self.config_address_of(slave_idx),
                inst as u16,
                self.config.slaves[slave_idx].slots[inst],
            )
        }
    }
}

// ---------------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------------

/// start positions of every table's record area within the table section
#[derive(Debug, Default)]
struct TableIndex {
    cnnc: usize,
    prdc: usize,
    cnls: usize,
    cnsm: usize,
    cnfg: usize,
    rtbt: usize,
    conn_end: usize,
    slst: Option<usize>,
    stpl: Option<usize>,
    prmt: Option<usize>,
    n_connections: usize,
    n_producers: usize,
    n_consumers: usize,
}

/// Scan on 4-byte boundaries for a table magic preceded by the end sign.
fn find_table(data: &[u8], from: usize, magic: &[u8; 4]) -> Result<usize, Error> {
    let mut pos = (from + 3) / 4 * 4;
    while pos + 4 <= data.len() {
        if &data[pos..pos + 4] == magic {
            if pos < 4 || &data[pos - 4..pos] != END_SIGN {
                return Err(Error::WrongBinConfigFormat);
            }
            return Ok(pos + 4);
        }
        pos += 4;
    }
    Err(Error::WrongBinConfigFormat)
}

fn search_table_headers(data: &[u8]) -> Result<TableIndex, Error> {
    let mut index = TableIndex::default();
    if data.len() < 4 || &data[0..4] != T_CNNC {
        return Err(Error::WrongBinConfigFormat);
    }
    index.cnnc = 4;
    index.prdc = find_table(data, index.cnnc, T_PRDC)?;
    // plausibility: the distance must hold whole connection records
    if (index.prdc - 8 - index.cnnc) % CONN_RECORD_LEN != 0 {
        return Err(Error::WrongBinConfigFormat);
    }
    index.n_connections = (index.prdc - 8 - index.cnnc) / CONN_RECORD_LEN;
    index.cnls = find_table(data, index.prdc, T_CNLS)?;
    if (index.cnls - 8 - index.prdc) % PROD_RECORD_LEN != 0 {
        return Err(Error::WrongBinConfigFormat);
    }
    index.n_producers = (index.cnls - 8 - index.prdc) / PROD_RECORD_LEN;
    index.cnsm = find_table(data, index.cnls, T_CNSM)?;
    index.cnfg = find_table(data, index.cnsm, T_CNFG)?;
    if (index.cnfg - 8 - index.cnsm) % CONS_RECORD_LEN != 0 {
        return Err(Error::WrongBinConfigFormat);
    }
    index.n_consumers = (index.cnfg - 8 - index.cnsm) / CONS_RECORD_LEN;
    index.rtbt = find_table(data, index.cnfg, T_RTBT)?;

    // behind the RT bits table follows either the slave setup block or
    // the end of the connection configuration
    if let Ok(pos) = find_table(data, index.rtbt, T_SLST) {
        index.conn_end = pos - 8;
        let stpl = find_table(data, pos, T_STPL)?;
        let prmt = find_table(data, stpl, T_PRMT)?;
        find_table(data, prmt, FILE_END)?;
        index.slst = Some(pos);
        index.stpl = Some(stpl);
        index.prmt = Some(prmt);
    } else {
        let pos = find_table(data, index.rtbt, FILE_END)?;
        index.conn_end = pos - 8;
    }
    Ok(index)
}

struct ConnRecord {
    key: u16,
    number: u16,
    telegram_assignment: u16,
    length: u16,
    application_id: u16,
    name: [u8; CONN_NAME_LENGTH],
    producer_key: u16,
    consumer_list_key: u16,
}

struct PartRecord {
    key: u16,
    address: u16,
    cycle_time: u32,
    instance: u16,
    /// producer: table dummy / AT marker; consumer: allowed losses
    aux: u16,
    config_key: u16,
    rtb_key: u16,
}

fn read_conn_record(data: &[u8], base: usize, nr: usize) -> ConnRecord {
    let at = base + nr * CONN_RECORD_LEN;
    let mut name = [0u8; CONN_NAME_LENGTH];
    name.copy_from_slice(&data[at + 10..at + 10 + CONN_NAME_LENGTH]);
    ConnRecord {
        key: LittleEndian::read_u16(&data[at..]),
        number: LittleEndian::read_u16(&data[at + 2..]),
        telegram_assignment: LittleEndian::read_u16(&data[at + 4..]),
        length: LittleEndian::read_u16(&data[at + 6..]),
        application_id: LittleEndian::read_u16(&data[at + 8..]),
        name,
        producer_key: LittleEndian::read_u16(&data[at + 40..]),
        consumer_list_key: LittleEndian::read_u16(&data[at + 42..]),
    }
}

fn read_part_record(data: &[u8], at: usize) -> PartRecord {
    PartRecord {
        key: LittleEndian::read_u16(&data[at..]),
        address: LittleEndian::read_u16(&data[at + 2..]),
        cycle_time: LittleEndian::read_u32(&data[at + 4..]),
        instance: LittleEndian::read_u16(&data[at + 8..]),
        aux: LittleEndian::read_u16(&data[at + 10..]),
        config_key: LittleEndian::read_u16(&data[at + 12..]),
        rtb_key: LittleEndian::read_u16(&data[at + 14..]),
    }
}

/// consumer keys of one consumer-list entry
fn consumer_list(data: &[u8], cnls: usize, cnsm_table: usize, list_key: u16) -> Option<Vec<u16>> {
    let mut pos = cnls;
    while pos + 4 <= cnsm_table - 8 {
        let key = LittleEndian::read_u16(&data[pos..]);
        let n = usize::from(LittleEndian::read_u16(&data[pos + 2..]));
        let body = pos + 4;
        if body + 2 * n > cnsm_table - 8 {
            return None;
        }
        if key == list_key {
            let mut keys = Vec::with_capacity(n);
            for i in 0..n {
                keys.push(LittleEndian::read_u16(&data[body + 2 * i..]));
            }
            return Some(keys);
        }
        pos = body + 2 * n + if n % 2 == 1 { 2 } else { 0 };
    }
    None
}

/// rollback journal: every mutation of the live graph in one decode run,
/// kept as a sparse set so a failure can restore the graph exactly
#[derive(Debug, Default)]
struct Journal {
    conns: Vec<u16>,
    configs: Vec<(u16, u16)>, // (file key, graph index)
    rtbs: Vec<(u16, u16)>,
    master_slots: Vec<u16>,
    slave_slots: Vec<(u16, u16)>,
    setups: Vec<u16>,
    lists: Vec<(u16, u16)>,
    params: Vec<(u16, u16)>,
    // prior values of entries removed by the application-ID clearing
    cleared_conns: Vec<(u16, Connection)>,
    cleared_configs: Vec<(u16, super::config::Configuration)>,
    cleared_rtbs: Vec<(u16, super::config::RtBitsConfig)>,
    cleared_master_slots: Vec<(u16, ConnSlot)>,
    cleared_slave_slots: Vec<(u16, u16, ConnSlot)>,
    cleared_setups: Vec<(u16, SlaveSetup)>,
    cleared_lists: Vec<(u16, SetupParamsList)>,
    cleared_params: Vec<(u16, SetupParameter)>,
}

impl Journal {
    fn config_index(&self, key: u16) -> Option<u16> {
        self.configs.iter().find(|(k, _)| *k == key).map(|(_, i)| *i)
    }

    fn rtb_index(&self, key: u16) -> Option<u16> {
        self.rtbs.iter().find(|(k, _)| *k == key).map(|(_, i)| *i)
    }

    fn list_index(&self, key: u16) -> Option<u16> {
        self.lists.iter().find(|(k, _)| *k == key).map(|(_, i)| *i)
    }

    fn param_index(&self, key: u16) -> Option<u16> {
        self.params.iter().find(|(k, _)| *k == key).map(|(_, i)| *i)
    }
}

impl<H: Hal> Master<H> {
    /// Merge a binary connection configuration into the live graph.
    ///
    /// Live connections whose application ID appears in the file are
    /// replaced. On any failure every mutation of this call is rolled
    /// back and the graph is left exactly as it was.
    pub fn process_bin_config(
        &mut self,
        source: &[u8],
        options: DecodeOptions,
    ) -> Result<(), Error> {
        if source.len() < 4 {
            return Err(Error::NoBinConfig);
        }
        let list_len = LittleEndian::read_u16(source) as usize;
        if list_len < LIST_HEADER_LEN as usize || list_len % 4 != 0 {
            return Err(Error::NoBinConfig);
        }
        if source.len() < 4 + list_len {
            return Err(Error::NoBinConfig);
        }
        if &source[4..14] != MAGIC {
            return Err(Error::NoBinConfig);
        }
        if LittleEndian::read_u16(&source[14..]) != BIN_CONFIG_VERSION_01_01 {
            return Err(Error::WrongBinConfigVersion);
        }
        if list_len == LIST_HEADER_LEN as usize {
            // an empty list carries nothing to merge
            return Ok(());
        }

        let data = &source[16..4 + list_len];
        let mut journal = Journal::default();
        let result = self.decode_tables(data, options, &mut journal);
        if result.is_err() {
            self.rollback(&journal);
        }
        result
    }

    fn decode_tables(
        &mut self,
        data: &[u8],
        options: DecodeOptions,
        journal: &mut Journal,
    ) -> Result<(), Error> {
        let index = search_table_headers(data)?;
        let check_addresses = self.slaves.is_projected();

        // cross-table key validation
        for nr in 0..index.n_connections {
            let record = read_conn_record(data, index.cnnc, nr);
            let mut producer_found = false;
            for p in 0..index.n_producers {
                if LittleEndian::read_u16(&data[index.prdc + p * PROD_RECORD_LEN..])
                    == record.producer_key
                {
                    producer_found = true;
                    break;
                }
            }
            if !producer_found {
                return Err(Error::NoProducerKey);
            }
            let keys = consumer_list(data, index.cnls, index.cnsm, record.consumer_list_key)
                .ok_or(Error::NoConsumerListKey)?;
            for key in keys {
                let mut found = false;
                for c in 0..index.n_consumers {
                    if LittleEndian::read_u16(&data[index.cnsm + c * CONS_RECORD_LEN..]) == key {
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(Error::NoConsumerKey);
                }
            }
        }

        // address validation against the projected list, when present
        if check_addresses {
            for p in 0..index.n_producers {
                let record = read_part_record(data, index.prdc + p * PROD_RECORD_LEN);
                self.check_table_address(record.address)?;
            }
            for c in 0..index.n_consumers {
                let record = read_part_record(data, index.cnsm + c * CONS_RECORD_LEN);
                self.check_table_address(record.address)?;
            }
        }

        // replace live connections of the incoming application IDs
        let mut incoming_app_ids: Vec<u16> = Vec::new();
        for nr in 0..index.n_connections {
            let app = read_conn_record(data, index.cnnc, nr).application_id;
            if !incoming_app_ids.contains(&app) {
                incoming_app_ids.push(app);
            }
        }
        self.clear_app_id_connections(&incoming_app_ids, journal);

        // same for slave setup lists of the incoming application IDs
        if let (Some(stpl), Some(prmt)) = (index.stpl, index.prmt) {
            let mut setup_app_ids: Vec<u16> = Vec::new();
            let mut pos = stpl;
            while pos + 6 <= prmt - 8 {
                let app = LittleEndian::read_u16(&data[pos + 2..]);
                if !setup_app_ids.contains(&app) {
                    setup_app_ids.push(app);
                }
                let n = usize::from(LittleEndian::read_u16(&data[pos + 4..]));
                pos += 6 + 2 * n + if n % 2 == 0 { 2 } else { 0 };
            }
            self.clear_app_id_setup_params(&setup_app_ids, journal);
        }

        let mut used = self.config.used_markers(self.slave_count_for_config());

        // configurations
        self.decode_configurations(data, &index, &mut used, journal)?;
        // real-time bits
        self.decode_rt_bits(data, &index, &mut used, journal)?;
        // connections with their producers and consumers
        self.decode_connections(data, &index, options, &mut used, journal)?;
        // optional slave setup block
        if index.slst.is_some() {
            self.decode_slave_setup(data, &index, &mut used, journal)?;
        }
        Ok(())
    }

    fn check_table_address(&self, address: u16) -> Result<(), Error> {
        if address == 0 {
            return Ok(());
        }
        if self.slaves.index_of(address).is_some() || self.slaves.is_deactivated(address) {
            Ok(())
        } else {
            Err(Error::WrongSlaveAddress(address))
        }
    }

    /// Unlink and clear every live connection whose application ID is in
    /// `app_ids`, together with configurations and RT-bit bindings no
    /// other connection references. Prior values go into the journal.
    fn clear_app_id_connections(&mut self, app_ids: &[u16], journal: &mut Journal) {
        let num_slaves = self.slave_count_for_config();
        let used = self.config.used_markers(num_slaves);
        let mut freed_configs: Vec<u16> = Vec::new();
        let mut freed_rtbs: Vec<u16> = Vec::new();

        for conn_idx in 0..MAX_GLOB_CONN {
            if !used.conn[conn_idx]
                || !app_ids.contains(&self.config.connections[conn_idx].application_id)
            {
                continue;
            }
            for (inst, slot) in self.config.master.slots.iter_mut().enumerate() {
                if slot.conn_idx == conn_idx as u16 {
                    if slot.config_idx != EMPTY && !freed_configs.contains(&slot.config_idx) {
                        freed_configs.push(slot.config_idx);
                    }
                    if slot.rt_bits_idx != EMPTY && !freed_rtbs.contains(&slot.rt_bits_idx) {
                        freed_rtbs.push(slot.rt_bits_idx);
                    }
                    journal.cleared_master_slots.push((inst as u16, *slot));
                    slot.clear();
                }
            }
            for (s, slave) in self.config.slaves.iter_mut().enumerate().take(num_slaves) {
                for (inst, slot) in slave.slots.iter_mut().enumerate() {
                    if slot.conn_idx == conn_idx as u16 {
                        if slot.config_idx != EMPTY && !freed_configs.contains(&slot.config_idx) {
                            freed_configs.push(slot.config_idx);
                        }
                        if slot.rt_bits_idx != EMPTY && !freed_rtbs.contains(&slot.rt_bits_idx) {
                            freed_rtbs.push(slot.rt_bits_idx);
                        }
                        journal
                            .cleared_slave_slots
                            .push((s as u16, inst as u16, *slot));
                        slot.clear();
                    }
                }
            }
            journal
                .cleared_conns
                .push((conn_idx as u16, self.config.connections[conn_idx].clone()));
            self.config.connections[conn_idx] = Connection::default();
        }

        // drop freed configurations and bindings that are now orphaned
        let used = self.config.used_markers(num_slaves);
        for idx in freed_configs {
            if !used.config[idx as usize] {
                journal
                    .cleared_configs
                    .push((idx, self.config.configurations[idx as usize].clone()));
                self.config.configurations[idx as usize] = Default::default();
            }
        }
        for idx in freed_rtbs {
            if !used.rt_bits[idx as usize] {
                journal
                    .cleared_rtbs
                    .push((idx, self.config.rt_bits[idx as usize].clone()));
                self.config.rt_bits[idx as usize] = Default::default();
            }
        }
    }

    /// Unlink and clear every live slave setup whose parameter list
    /// carries one of the incoming application IDs, together with lists
    /// and parameters that became unreferenced.
    fn clear_app_id_setup_params(&mut self, app_ids: &[u16], journal: &mut Journal) {
        let mut freed_lists: Vec<u16> = Vec::new();
        for setup_idx in 0..MAX_SLAVE_SETUP {
            let setup = self.config.slave_setups[setup_idx];
            if !setup.is_used() {
                continue;
            }
            let list_idx = setup.list_idx as usize;
            if !app_ids.contains(&self.config.setup_lists[list_idx].application_id) {
                continue;
            }
            journal.cleared_setups.push((setup_idx as u16, setup));
            self.config.slave_setups[setup_idx] = SlaveSetup::default();
            if !freed_lists.contains(&(list_idx as u16)) {
                freed_lists.push(list_idx as u16);
            }
        }
        let used = self.config.used_markers(self.slave_count_for_config());
        for list_idx in freed_lists {
            if used.setup_list[list_idx as usize] {
                continue;
            }
            let params: Vec<u16> = self.config.setup_lists[list_idx as usize].params.to_vec();
            journal.cleared_lists.push((
                list_idx,
                self.config.setup_lists[list_idx as usize].clone(),
            ));
            self.config.setup_lists[list_idx as usize] = Default::default();
            for p in params {
                if !used.setup_param[p as usize] {
                    journal
                        .cleared_params
                        .push((p, self.config.setup_params[p as usize].clone()));
                    self.config.setup_params[p as usize] = Default::default();
                }
            }
        }
    }

    fn decode_configurations(
        &mut self,
        data: &[u8],
        index: &TableIndex,
        used: &mut UsedMarkers,
        journal: &mut Journal,
    ) -> Result<(), Error> {
        let mut pos = index.cnfg;
        while pos + 8 <= index.rtbt - 8 {
            let key = LittleEndian::read_u16(&data[pos..]);
            let setup = LittleEndian::read_u16(&data[pos + 2..]);
            let capability = LittleEndian::read_u16(&data[pos + 4..]);
            let n_idns = usize::from(LittleEndian::read_u16(&data[pos + 6..]));
            if n_idns > MAX_IDN_PER_CONNECTION {
                return Err(Error::TooManyIdnForConn);
            }
            if pos + 8 + 4 * n_idns > index.rtbt - 8 {
                return Err(Error::WrongBinConfigFormat);
            }
            let free = (0..MAX_GLOB_CONFIG)
                .find(|&i| !used.config[i])
                .ok_or(Error::TooManyConfigurations)?;
            let config = &mut self.config.configurations[free];
            config.setup = setup;
            config.capability = capability;
            config.idns.clear();
            for i in 0..n_idns {
                config
                    .idns
                    .push(LittleEndian::read_u32(&data[pos + 8 + 4 * i..]));
            }
            used.config[free] = true;
            journal.configs.push((key, free as u16));
            pos += 8 + 4 * n_idns;
        }
        Ok(())
    }

    fn decode_rt_bits(
        &mut self,
        data: &[u8],
        index: &TableIndex,
        used: &mut UsedMarkers,
        journal: &mut Journal,
    ) -> Result<(), Error> {
        const RECORD: usize = 4 + MAX_RT_BITS_PER_CONN * 6;
        let mut pos = index.rtbt;
        while pos + RECORD <= index.conn_end {
            let key = LittleEndian::read_u16(&data[pos..]);
            let free = (0..MAX_RT_BIT_CONFIG)
                .find(|&i| !used.rt_bits[i])
                .ok_or(Error::TooManyRtbConfig)?;
            let rtb = &mut self.config.rt_bits[free];
            for i in 0..MAX_RT_BITS_PER_CONN {
                rtb.idns[i] = LittleEndian::read_u32(&data[pos + 4 + 4 * i..]);
            }
            for i in 0..MAX_RT_BITS_PER_CONN {
                rtb.bit_in_idn[i] =
                    LittleEndian::read_u16(&data[pos + 4 + 4 * MAX_RT_BITS_PER_CONN + 2 * i..]);
            }
            used.rt_bits[free] = true;
            journal.rtbs.push((key, free as u16));
            pos += RECORD;
        }
        Ok(())
    }

    /// resolve the slave index of a Sercos address for decoding, using
    /// the parser-temporary list while no projection exists
    fn decode_slave_index(&mut self, address: u16) -> Result<Option<usize>, Error> {
        if self.slaves.is_projected() {
            match self.slaves.index_of(address) {
                Some(idx) => Ok(Some(idx)),
                // deactivated addresses are tolerated, their connection
                // part is skipped
                None if self.slaves.is_deactivated(address) => Ok(None),
                None => Err(Error::WrongSlaveAddress(address)),
            }
        } else {
            Ok(Some(self.slaves.temp_index_of(address)?))
        }
    }

    fn resolve_config_keys(
        &self,
        journal: &Journal,
        config_key: u16,
        rtb_key: u16,
    ) -> Result<(u16, u16), Error> {
        if config_key == 0 {
            return Err(Error::NoConfigurationKey);
        }
        let config_idx = journal
            .config_index(config_key)
            .ok_or(Error::NoConfigurationKey)?;
        let rtb_idx = if rtb_key == EMPTY {
            EMPTY
        } else {
            if rtb_key == 0 {
                return Err(Error::NoRtbConfigKey);
            }
            journal.rtb_index(rtb_key).ok_or(Error::NoRtbConfigKey)?
        };
        Ok((config_idx, rtb_idx))
    }

    /// allocate a master instance slot, honoring the recorded instance
    /// unless automatic assignment is requested
    fn allocate_master_slot(
        &mut self,
        record: &PartRecord,
        options: DecodeOptions,
        journal: &mut Journal,
    ) -> Result<usize, Error> {
        if options.auto_instances {
            let inst = self
                .config
                .master
                .slots
                .iter()
                .position(|s| !s.is_used())
                .ok_or(Error::TooManyConnForMaster)?;
            journal.master_slots.push(inst as u16);
            Ok(inst)
        } else {
            let inst = usize::from(record.instance);
            if inst >= MAX_CONN_MASTER {
                return Err(Error::ConnInstTooHigh);
            }
            if self.config.master.slots[inst].is_used() {
                return Err(Error::ConnInstAlreadyUsed);
            }
            journal.master_slots.push(inst as u16);
            Ok(inst)
        }
    }

    fn allocate_slave_slot(
        &mut self,
        slave_idx: usize,
        record: &PartRecord,
        options: DecodeOptions,
        journal: &mut Journal,
    ) -> Result<usize, Error> {
        if options.auto_instances {
            let inst = self.config.slaves[slave_idx]
                .slots
                .iter()
                .position(|s| !s.is_used())
                .ok_or(Error::TooManyConnForSlave)?;
            journal.slave_slots.push((slave_idx as u16, inst as u16));
            Ok(inst)
        } else {
            let inst = usize::from(record.instance);
            if inst >= MAX_CONN_PER_SLAVE {
                return Err(Error::ConnInstTooHigh);
            }
            if self.config.slaves[slave_idx].slots[inst].is_used() {
                return Err(Error::ConnInstAlreadyUsed);
            }
            journal.slave_slots.push((slave_idx as u16, inst as u16));
            Ok(inst)
        }
    }

    fn decode_connections(
        &mut self,
        data: &[u8],
        index: &TableIndex,
        options: DecodeOptions,
        used: &mut UsedMarkers,
        journal: &mut Journal,
    ) -> Result<(), Error> {
        for nr in 0..index.n_connections {
            let record = read_conn_record(data, index.cnnc, nr);

            // producer record of this connection
            let mut producer = None;
            for p in 0..index.n_producers {
                let part = read_part_record(data, index.prdc + p * PROD_RECORD_LEN);
                if part.key == record.producer_key {
                    producer = Some(part);
                    break;
                }
            }
            let producer = producer.ok_or(Error::NoProducerKey)?;

            // consumer records, skipping deactivated addresses
            let keys = consumer_list(data, index.cnls, index.cnsm, record.consumer_list_key)
                .ok_or(Error::NoConsumerListKey)?;
            let mut consumers: Vec<PartRecord> = Vec::new();
            for key in keys {
                for c in 0..index.n_consumers {
                    let part = read_part_record(data, index.cnsm + c * CONS_RECORD_LEN);
                    if part.key == key {
                        consumers.push(part);
                        break;
                    }
                }
            }

            // a connection whose producer has been deactivated is not
            // instantiated, same when no reachable consumer remains
            let producer_slave = self.decode_slave_index(producer.address)?;
            if producer.address != 0 && producer_slave.is_none() {
                continue;
            }
            let mut reachable = Vec::new();
            for cons in consumers {
                let slave = self.decode_slave_index(cons.address)?;
                if cons.address != 0 && slave.is_none() {
                    continue;
                }
                reachable.push((cons, slave));
            }
            if reachable.is_empty() {
                continue;
            }

            // allocate the global connection entry
            let free = (0..MAX_GLOB_CONN)
                .find(|&i| !used.conn[i])
                .ok_or(Error::TooManyConnections)?;
            used.conn[free] = true;
            journal.conns.push(free as u16);
            let number = if options.auto_conn_numbers {
                let nbr = (0..MAX_GLOB_CONN as u16)
                    .find(|&n| !used.conn_nbr[n as usize])
                    .map(|n| n + 1)
                    .ok_or(Error::TooManyConnections)?;
                used.conn_nbr[(nbr - 1) as usize] = true;

                nbr
            } else {
                let nbr = record.number;
                if nbr > 0 && nbr as usize <= MAX_GLOB_CONN {
                    if used.conn_nbr[(nbr - 1) as usize] {
                        return Err(Error::ConnNbrAlreadyUsed);
                    }
                    used.conn_nbr[(nbr - 1) as usize] = true;

                }
                nbr
            };

            let telegram_type = if producer.address == 0 {
                if producer.aux == MASTER_PROD_AT {
                    TelegramType::At
                } else {
                    TelegramType::Mdt
                }
            } else {
                TelegramType::At
            };
            let allowed_losses = reachable.first().map(|(c, _)| c.aux).unwrap_or(0);
            self.config.connections[free] = Connection {
                number,
                telegram_assignment: record.telegram_assignment,
                length: record.length,
                cycle_time: producer.cycle_time,
                allowed_losses,
                application_id: record.application_id,
                telegram_type,
                name: record.name,
            };

            // link the producer instance
            let (config_idx, rtb_idx) =
                self.resolve_config_keys(journal, producer.config_key, producer.rtb_key)?;
            let slot = ConnSlot {
                conn_idx: free as u16,
                config_idx,
                rt_bits_idx: rtb_idx,
            };
            match producer_slave {
                None => {
                    let inst = self.allocate_master_slot(&producer, options, journal)?;
                    self.config.master.slots[inst] = slot;
                }
                Some(slave_idx) => {
                    let inst = self.allocate_slave_slot(slave_idx, &producer, options, journal)?;
                    self.config.slaves[slave_idx].slots[inst] = slot;
                }
            }

            // link every reachable consumer instance
            for (cons, slave) in reachable {
                let (config_idx, rtb_idx) =
                    self.resolve_config_keys(journal, cons.config_key, cons.rtb_key)?;
                let slot = ConnSlot {
                    conn_idx: free as u16,
                    config_idx,
                    rt_bits_idx: rtb_idx,
                };
                match slave {
                    None => {
                        let inst = self.allocate_master_slot(&cons, options, journal)?;
                        self.config.master.slots[inst] = slot;
                    }
                    Some(slave_idx) => {
                        let inst = self.allocate_slave_slot(slave_idx, &cons, options, journal)?;
                        self.config.slaves[slave_idx].slots[inst] = slot;
                    }
                }
            }
        }
        Ok(())
    }

    fn decode_slave_setup(
        &mut self,
        data: &[u8],
        index: &TableIndex,
        used: &mut UsedMarkers,
        journal: &mut Journal,
    ) -> Result<(), Error> {
        let (slst, stpl, prmt) = match (index.slst, index.stpl, index.prmt) {
            (Some(slst), Some(stpl), Some(prmt)) => (slst, stpl, prmt),
            _ => return Ok(()),
        };

        // parameters first so the lists can resolve their keys
        let mut pos = prmt;
        while pos + 8 <= data.len().saturating_sub(8) {
            if &data[pos..pos + 4] == END_SIGN {
                break;
            }
            let key = LittleEndian::read_u16(&data[pos..]);
            let len = usize::from(LittleEndian::read_u16(&data[pos + 2..]));
            if len > MAX_PARAM_DATA {
                return Err(Error::TooManyParameterData);
            }
            if pos + 8 + len > data.len() {
                return Err(Error::WrongBinConfigFormat);
            }
            let idn = LittleEndian::read_u32(&data[pos + 4..]);
            let free = (0..MAX_SETUP_PARAMETER)
                .find(|&i| !used.setup_param[i])
                .ok_or(Error::TooManySetupParameter)?;
            self.config.setup_params[free] = SetupParameter {
                idn,
                data: data[pos + 8..pos + 8 + len].to_vec(),
            };
            used.setup_param[free] = true;
            journal.params.push((key, free as u16));
            pos += 8 + len + (4 - len % 4) % 4;
        }

        // parameter lists
        let mut pos = stpl;
        while pos + 6 <= prmt - 8 {
            let key = LittleEndian::read_u16(&data[pos..]);
            let app_id = LittleEndian::read_u16(&data[pos + 2..]);
            let n = usize::from(LittleEndian::read_u16(&data[pos + 4..]));
            if n > MAX_PARAMS_PER_LIST {
                return Err(Error::TooManyParameterInList);
            }
            let free = (0..MAX_SETUP_PARAMS_LIST)
                .find(|&i| !used.setup_list[i])
                .ok_or(Error::TooManySetupLists)?;
            let mut list = SetupParamsList {
                application_id: app_id,
                params: Default::default(),
            };
            for i in 0..n {
                let param_key = LittleEndian::read_u16(&data[pos + 6 + 2 * i..]);
                if param_key == 0 {
                    return Err(Error::NoSetupParameterKey);
                }
                let param_idx = journal
                    .param_index(param_key)
                    .ok_or(Error::NoSetupParameterKey)?;
                list.params.push(param_idx);
            }
            self.config.setup_lists[free] = list;
            used.setup_list[free] = true;
            journal.lists.push((key, free as u16));
            pos += 6 + 2 * n + if n % 2 == 0 { 2 } else { 0 };
        }

        // slave bindings
        let mut pos = slst;
        while pos + 4 <= stpl - 8 {
            let address = LittleEndian::read_u16(&data[pos..]);
            let list_key = LittleEndian::read_u16(&data[pos + 2..]);
            if list_key == 0 {
                return Err(Error::NoSetupListKey);
            }
            let list_idx = journal.list_index(list_key).ok_or(Error::NoSetupListKey)?;
            if address != 0 && self.slaves.is_projected() {
                self.check_table_address(address)?;
            }
            let free = self
                .config
                .slave_setups
                .iter()
                .position(|s| !s.is_used())
                .ok_or(Error::TooManySlaveSetup)?;
            self.config.slave_setups[free] = SlaveSetup {
                slave_address: address,
                list_idx,
            };
            journal.setups.push(free as u16);
            pos += 4;
        }
        Ok(())
    }

    /// Undo every mutation recorded in the journal: drop the allocations
    /// of this call, then restore what the clearing step removed.
    fn rollback(&mut self, journal: &Journal) {
        for &(_, idx) in journal.configs.iter() {
            self.config.configurations[idx as usize] = Default::default();
        }
        for &(_, idx) in journal.rtbs.iter() {
            self.config.rt_bits[idx as usize] = Default::default();
        }
        for &idx in journal.conns.iter() {
            self.config.connections[idx as usize] = Connection::default();
        }
        for &inst in journal.master_slots.iter() {
            self.config.master.slots[inst as usize].clear();
        }
        for &(slave_idx, inst) in journal.slave_slots.iter() {
            self.config.slaves[slave_idx as usize].slots[inst as usize].clear();
        }
        for &idx in journal.setups.iter() {
            self.config.slave_setups[idx as usize] = SlaveSetup::default();
        }
        for &(_, idx) in journal.lists.iter() {
            self.config.setup_lists[idx as usize] = Default::default();
        }
        for &(_, idx) in journal.params.iter() {
            self.config.setup_params[idx as usize] = Default::default();
        }

        for (idx, conn) in journal.cleared_conns.iter() {
            self.config.connections[*idx as usize] = conn.clone();
        }
        for (idx, config) in journal.cleared_configs.iter() {
            self.config.configurations[*idx as usize] = config.clone();
        }
        for (idx, rtb) in journal.cleared_rtbs.iter() {
            self.config.rt_bits[*idx as usize] = rtb.clone();
        }
        for &(inst, slot) in journal.cleared_master_slots.iter() {
            self.config.master.slots[inst as usize] = slot;
        }
        for &(slave_idx, inst, slot) in journal.cleared_slave_slots.iter() {
            self.config.slaves[slave_idx as usize].slots[inst as usize] = slot;
        }
        for &(idx, setup) in journal.cleared_setups.iter() {
            self.config.slave_setups[idx as usize] = setup;
        }
        for (idx, list) in journal.cleared_lists.iter() {
            self.config.setup_lists[*idx as usize] = list.clone();
        }
        for (idx, param) in journal.cleared_params.iter() {
            self.config.setup_params[*idx as usize] = param.clone();
        }
    }

    /// Reset the parser-temporary slave addressing before decoding a
    /// configuration into an unprojected instance.
    pub fn init_temp_conn_configs(&mut self) {
        if self.slaves.is_projected() {
            return;
        }
        self.slaves.clear_parser_temp();
        for slave in self.config.slaves.iter_mut() {
            for slot in slave.slots.iter_mut() {
                slot.clear();
            }
        }
    }

    /// Validate configurations decoded against the parser-temporary
    /// address list once the projected slave list exists, and re-home
    /// them onto the projected slave indices.
    pub fn transfer_temp_conn_configs(&mut self) -> Result<(), Error> {
        if !self.slaves.is_projected() || self.slaves.parser_temp.is_empty() {
            return Ok(());
        }
        let temp = self.slaves.parser_temp.clone();
        for &address in temp.iter() {
            if self.slaves.index_of(address).is_none() && !self.slaves.is_deactivated(address) {
                return Err(Error::WrongSlaveAddress(address));
            }
        }
        let mut remapped = vec![super::config::SlaveConfig::default(); MAX_SLAVES];
        for (temp_idx, &address) in temp.iter().enumerate() {
            if let Some(proj_idx) = self.slaves.index_of(address) {
                remapped[proj_idx] = self.config.slaves[temp_idx].clone();
            }
        }
        self.config.slaves = remapped;
        self.slaves.clear_parser_temp();
        Ok(())
    }
}

/// Connection graphs are equal up to key renumbering when the per-
/// connection attributes and participant structure match.
pub fn graphs_equivalent(a: &super::config::ConfigGraph, b: &super::config::ConfigGraph) -> bool {
    fn shape(graph: &super::config::ConfigGraph) -> Vec<String> {
        let mut out = Vec::new();
        let used = graph.used_markers(MAX_SLAVES);
        for idx in 0..MAX_GLOB_CONN {
            if !used.conn[idx] {
                continue;
            }
            let conn = &graph.connections[idx];
            let producer = graph.producer_of(idx as u16, MAX_SLAVES);
            let mut consumers: Vec<u16> = Vec::new();
            for (s, slave) in graph.slaves.iter().enumerate() {
                for slot in slave.slots.iter() {
                    if slot.conn_idx == idx as u16
                        && slot.config_idx != EMPTY
                        && graph.configurations[slot.config_idx as usize].is_active_consumer()
                    {
                        consumers.push(s as u16);
                    }
                }
            }
            let master_consumes = graph.master.slots.iter().any(|slot| {
                slot.conn_idx == idx as u16
                    && slot.config_idx != EMPTY
                    && graph.configurations[slot.config_idx as usize].is_active_consumer()
            });
            consumers.sort_unstable();
            out.push(format!(
                "{:?}|{}|{}|{}|{}|{:?}|{:?}|{:?}|{}",
                conn.telegram_type,
                conn.length,
                conn.cycle_time,
                conn.allowed_losses,
                conn.application_id,
                producer.map(|p| match p {
                    ProducerId::Master => EMPTY,
                    ProducerId::Slave(s) => s,
                }),
                consumers,
                conn.name_str(),
                master_consumes,
            ));
        }
        out.sort();
        out
    }
    shape(a) == shape(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigGraph;
    use crate::master::Options;
    use crate::sim::SoftFpga;

    fn open_master() -> Master<SoftFpga> {
        Master::open(SoftFpga::new(), ConfigGraph::default(), Options::default()).unwrap()
    }

    /// master produces conn 0 to slave 3; slave 3 produces conn 1 back
    fn sample_master() -> Master<SoftFpga> {
        let mut master = open_master();
        master.project_slaves(&[3, 7]).unwrap();
        let graph = &mut master.config;
        graph.connections[0] = Connection {
            number: 1,
            length: 4,
            cycle_time: 1_000_000,
            allowed_losses: 2,
            application_id: 0x11,
            telegram_type: TelegramType::Mdt,
            ..Connection::default()
        };
        graph.connections[0].set_name("cmd");
        graph.configurations[0].setup = S_1050_SE1_ACTIVE_PRODUCER;
        graph.configurations[0].idns.push(0x0001_1234);
        graph.configurations[1].setup = S_1050_SE1_ACTIVE_CONSUMER;
        graph.master.slots[0] = ConnSlot {
            conn_idx: 0,
            config_idx: 0,
            rt_bits_idx: EMPTY,
        };
        graph.slaves[0].slots[0] = ConnSlot {
            conn_idx: 0,
            config_idx: 1,
            rt_bits_idx: EMPTY,
        };
        graph.connections[1] = Connection {
            number: 2,
            length: 6,
            cycle_time: 2_000_000,
            allowed_losses: 1,
            application_id: 0x11,
            telegram_type: TelegramType::At,
            ..Connection::default()
        };
        graph.connections[1].set_name("state");
        graph.configurations[2].setup = S_1050_SE1_ACTIVE_CONSUMER | S_1050_SE1_ASYNC;
        graph.configurations[3].setup = S_1050_SE1_ACTIVE_PRODUCER;
        graph.rt_bits[0].idns[0] = 0x0002_0007;
        graph.rt_bits[0].bit_in_idn[0] = 3;
        graph.master.slots[1] = ConnSlot {
            conn_idx: 1,
            config_idx: 2,
            rt_bits_idx: 0,
        };
        graph.slaves[0].slots[1] = ConnSlot {
            conn_idx: 1,
            config_idx: 3,
            rt_bits_idx: EMPTY,
        };
        master
    }

    fn encode(master: &Master<SoftFpga>, max_len: u16) -> (Vec<u8>, Result<(), Error>) {
        let mut buf = vec![0u8; 4096];
        LittleEndian::write_u16(&mut buf[2..], max_len);
        let result = master.generate_bin_config(BIN_CONFIG_VERSION_01_01, UNIVERSAL_APP_ID, true, &mut buf);
        (buf, result)
    }

    #[test]
    fn test_empty_graph_encodes_header_only() {
        let master = open_master();
        let (buf, result) = encode(&master, 0);
        result.unwrap();
        assert_eq!(LittleEndian::read_u16(&buf), 12);
        assert_eq!(&buf[4..14], MAGIC);
        // decode of the header-only list is a no-op
        let mut other = open_master();
        other
            .process_bin_config(&buf, DecodeOptions::default())
            .unwrap();
        assert!(graphs_equivalent(&other.config, &open_master().config));
    }

    #[test]
    fn test_encode_layout_markers() {
        let master = sample_master();
        let (buf, result) = encode(&master, 0);
        result.unwrap();
        let len = LittleEndian::read_u16(&buf) as usize;
        assert!(len > 12);
        let body = &buf[4..4 + len];
        // first table directly after the version word
        assert_eq!(&body[12..16], T_CNNC);
        // terminated by the end sign and file end
        assert_eq!(&body[len - 8..len - 4], END_SIGN);
        assert_eq!(&body[len - 4..len], FILE_END);
        // list length is long aligned
        assert_eq!(len % 4, 0);
    }

    #[test]
    fn test_roundtrip_preserves_graph_shape() {
        let master = sample_master();
        let (buf, result) = encode(&master, 0);
        result.unwrap();

        let mut fresh = open_master();
        fresh.project_slaves(&[3, 7]).unwrap();
        fresh
            .process_bin_config(&buf, DecodeOptions::default())
            .unwrap();
        assert!(graphs_equivalent(&master.config, &fresh.config));

        // a second decode replaces, not duplicates
        fresh
            .process_bin_config(&buf, DecodeOptions::default())
            .unwrap();
        assert!(graphs_equivalent(&master.config, &fresh.config));
    }

    #[test]
    fn test_buffer_too_small_reports_zero_length() {
        let master = sample_master();
        let (buf, result) = encode(&master, 64);
        assert_eq!(result, Err(Error::BufferTooSmall));
        assert_eq!(LittleEndian::read_u16(&buf), 0);
        // nothing beyond the allowed window was touched
        assert!(buf[4 + 64..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_rejects_bad_magic_and_version() {
        let master = sample_master();
        let (mut buf, result) = encode(&master, 0);
        result.unwrap();

        let mut fresh = open_master();
        fresh.project_slaves(&[3, 7]).unwrap();

        let mut broken = buf.clone();
        broken[4] = b'X';
        assert_eq!(
            fresh.process_bin_config(&broken, DecodeOptions::default()),
            Err(Error::NoBinConfig)
        );

        LittleEndian::write_u16(&mut buf[14..], 0x0202);
        assert_eq!(
            fresh.process_bin_config(&buf, DecodeOptions::default()),
            Err(Error::WrongBinConfigVersion)
        );
    }

    #[test]
    fn test_decode_unknown_address_rolls_back() {
        let master = sample_master();
        let (buf, result) = encode(&master, 0);
        result.unwrap();

        // the target instance projects different addresses
        let mut fresh = open_master();
        fresh.project_slaves(&[9]).unwrap();
        let before = fresh.config.clone();
        assert_eq!(
            fresh.process_bin_config(&buf, DecodeOptions::default()),
            Err(Error::WrongSlaveAddress(3))
        );
        assert!(graphs_equivalent(&before, &fresh.config));
        assert!(!fresh.config.master.slots[0].is_used());
    }

    #[test]
    fn test_decode_into_unprojected_instance_uses_temp_addresses() {
        let master = sample_master();
        let (buf, result) = encode(&master, 0);
        result.unwrap();

        let mut fresh = open_master();
        fresh.init_temp_conn_configs();
        fresh
            .process_bin_config(&buf, DecodeOptions::default())
            .unwrap();
        assert_eq!(fresh.slaves.parser_temp, vec![3]);

        // once the scan projects the addresses the configuration is
        // adopted
        fresh.project_slaves(&[3, 7]).unwrap();
        fresh.transfer_temp_conn_configs().unwrap();
        assert!(graphs_equivalent(&master.config, &fresh.config));
    }

    #[test]
    fn test_decode_occupied_instance_reports_conflict() {
        let master = sample_master();
        let (buf, result) = encode(&master, 0);
        result.unwrap();

        let mut fresh = sample_master(); // instances 0 and 1 already taken
        // incoming app id 0x11 clears the existing connections first, so
        // use a conflicting foreign connection instead
        fresh.config.connections[0].application_id = 0x22;
        fresh.config.connections[1].application_id = 0x22;
        // keep the connection numbers out of the incoming number space
        fresh.config.connections[0].number = 11;
        fresh.config.connections[1].number = 12;
        assert_eq!(
            fresh.process_bin_config(&buf, DecodeOptions::default()),
            Err(Error::ConnInstAlreadyUsed)
        );
        // rollback left the foreign configuration alone
        assert_eq!(fresh.config.connections[0].application_id, 0x22);
        assert!(fresh.config.master.slots[0].is_used());
    }

    #[test]
    fn test_failed_decode_restores_cleared_connections() {
        let master = sample_master();
        let (buf, result) = encode(&master, 0);
        result.unwrap();

        // a foreign connection occupying number 1 forces a conflict after
        // the incoming application ID has already cleared the live
        // connections; the rollback must bring them back
        let mut fresh = sample_master();
        {
            let graph = &mut fresh.config;
            graph.connections[5] = Connection {
                number: 1,
                length: 4,
                cycle_time: 1_000_000,
                application_id: 0x33,
                telegram_type: TelegramType::Mdt,
                ..Connection::default()
            };
            graph.configurations[10].setup = S_1050_SE1_ACTIVE_PRODUCER;
            graph.configurations[11].setup = S_1050_SE1_ACTIVE_CONSUMER;
            graph.master.slots[5] = ConnSlot {
                conn_idx: 5,
                config_idx: 10,
                rt_bits_idx: EMPTY,
            };
            graph.slaves[1].slots[5] = ConnSlot {
                conn_idx: 5,
                config_idx: 11,
                rt_bits_idx: EMPTY,
            };
        }
        let before = fresh.config.clone();
        assert_eq!(
            fresh.process_bin_config(&buf, DecodeOptions::default()),
            Err(Error::ConnNbrAlreadyUsed)
        );
        assert!(graphs_equivalent(&before, &fresh.config));
        assert_eq!(fresh.config.connections[0].application_id, 0x11);
        assert!(fresh.config.master.slots[0].is_used());
    }

    #[test]
    fn test_auto_instances_avoid_conflict() {
        let master = sample_master();
        let (buf, result) = encode(&master, 0);
        result.unwrap();

        let mut fresh = sample_master();
        fresh.config.connections[0].application_id = 0x22;
        fresh.config.connections[1].application_id = 0x22;
        fresh
            .process_bin_config(
                &buf,
                DecodeOptions {
                    auto_conn_numbers: true,
                    auto_instances: true,
                },
            )
            .unwrap();
        // both the foreign and the merged connections are present now
        let used = fresh.config.used_markers(2);
        assert_eq!(used.conn.iter().filter(|&&u| u).count(), 4);
    }

    #[test]
    fn test_slave_setup_tables_roundtrip() {
        let mut master = sample_master();
        {
            let graph = &mut master.config;
            graph.setup_params[0] = SetupParameter {
                idn: 0x0001_0044,
                data: vec![1, 2, 3],
            };
            graph.setup_params[1] = SetupParameter {
                idn: 0x0001_0045,
                data: vec![9, 9, 9, 9],
            };
            graph.setup_lists[0].application_id = 0x11;
            graph.setup_lists[0].params.push(0);
            graph.setup_lists[0].params.push(1);
            graph.slave_setups[0] = SlaveSetup {
                slave_address: 3,
                list_idx: 0,
            };
        }
        let (buf, result) = encode(&master, 0);
        result.unwrap();

        let mut fresh = open_master();
        fresh.project_slaves(&[3, 7]).unwrap();
        fresh
            .process_bin_config(&buf, DecodeOptions::default())
            .unwrap();
        let setup = fresh.config.slave_setups[0];
        assert!(setup.is_used());
        assert_eq!(setup.slave_address, 3);
        let list = &fresh.config.setup_lists[setup.list_idx as usize];
        assert_eq!(list.params.len(), 2);
        let p0 = &fresh.config.setup_params[list.params[0] as usize];
        assert_eq!(p0.idn, 0x0001_0044);
        assert_eq!(p0.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_negative_filter_selects_complement() {
        let master = sample_master();
        let mut buf = vec![0u8; 4096];
        // nothing has an app id other than 0x11
        assert_eq!(
            master.generate_bin_config(BIN_CONFIG_VERSION_01_01, 0x11, false, &mut buf),
            Err(Error::ApplicationIdUnavailable)
        );
        // the positive filter for a missing id fails the same way
        assert_eq!(
            master.generate_bin_config(BIN_CONFIG_VERSION_01_01, 0x77, true, &mut buf),
            Err(Error::ApplicationIdUnavailable)
        );
    }
}
