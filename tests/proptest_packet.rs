use std::net::Ipv4Addr;

use proptest::prelude::*;

use leasekeeper::options::codec;
use leasekeeper::{DhcpOption, DhcpPacket, MessageType};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const DHCP_FIXED_HEADER_SIZE: usize = 240;

fn valid_header() -> Vec<u8> {
    let mut packet = vec![0u8; DHCP_FIXED_HEADER_SIZE];
    packet[0] = 1;
    packet[1] = 1;
    packet[2] = 6;
    packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
    packet
}

fn address() -> impl Strategy<Value = Ipv4Addr> {
    any::<[u8; 4]>().prop_map(Ipv4Addr::from)
}

fn addresses() -> impl Strategy<Value = Vec<Ipv4Addr>> {
    prop::collection::vec(address(), 1..8)
}

fn message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Discover),
        Just(MessageType::Offer),
        Just(MessageType::Request),
        Just(MessageType::Decline),
        Just(MessageType::Ack),
        Just(MessageType::Nak),
        Just(MessageType::Release),
        Just(MessageType::Inform),
    ]
}

fn text() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9.-]{0,40}"
}

fn blob() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Options that decode back to themselves. Pad, End and Overload are
/// framing rather than content and are left out.
fn option() -> impl Strategy<Value = DhcpOption> {
    prop_oneof![
        address().prop_map(DhcpOption::SubnetMask),
        addresses().prop_map(DhcpOption::Router),
        addresses().prop_map(DhcpOption::DnsServer),
        text().prop_map(DhcpOption::Hostname),
        text().prop_map(DhcpOption::DomainName),
        any::<u16>().prop_map(DhcpOption::InterfaceMtu),
        address().prop_map(DhcpOption::BroadcastAddress),
        address().prop_map(DhcpOption::RequestedIpAddress),
        any::<u32>().prop_map(DhcpOption::LeaseTime),
        message_type().prop_map(DhcpOption::MessageType),
        address().prop_map(DhcpOption::ServerIdentifier),
        blob().prop_map(DhcpOption::ParameterRequestList),
        text().prop_map(DhcpOption::Message),
        any::<u16>().prop_map(DhcpOption::MaxMessageSize),
        any::<u32>().prop_map(DhcpOption::RenewalTime),
        any::<u32>().prop_map(DhcpOption::RebindingTime),
        blob().prop_map(DhcpOption::VendorClassIdentifier),
        blob().prop_map(DhcpOption::ClientIdentifier),
        text().prop_map(DhcpOption::TftpServerName),
        text().prop_map(DhcpOption::BootFileName),
        blob().prop_map(DhcpOption::ClientFqdn),
        blob().prop_map(DhcpOption::RelayAgentInfo),
        (
            any::<u8>().prop_filter("code has a dedicated codec", |code| codec(*code).is_none()),
            blob()
        )
            .prop_map(|(code, data)| DhcpOption::Generic(code, data)),
    ]
}

prop_compose! {
    fn packet()(
        op in 1u8..=2,
        htype in any::<u8>(),
        hops in 0u8..=16,
        xid in any::<u32>(),
        secs in any::<u16>(),
        flags in any::<u16>(),
        ciaddr in address(),
        yiaddr in address(),
        siaddr in address(),
        giaddr in address(),
        chaddr in prop::collection::vec(any::<u8>(), 0..=16),
        sname in "[a-zA-Z0-9.-]{0,63}",
        file in "[a-zA-Z0-9./_-]{0,127}",
        options in prop::collection::vec(option(), 0..12),
    ) -> DhcpPacket {
        DhcpPacket {
            op,
            htype,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10000))]

    #[test]
    fn decode_never_panics_on_arbitrary_bytes(data: Vec<u8>) {
        let _ = DhcpPacket::decode(&data);
    }

    #[test]
    fn decode_never_panics_on_valid_header_with_random_options(
        options_data in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let mut packet = valid_header();
        packet.extend_from_slice(&options_data);
        let _ = DhcpPacket::decode(&packet);
    }

    #[test]
    fn decode_never_panics_on_corrupted_header(
        corrupted_bytes in prop::collection::vec(any::<u8>(), 240..600),
        corruption_indices in prop::collection::vec(0usize..240, 1..10),
        corruption_values in prop::collection::vec(any::<u8>(), 1..10)
    ) {
        let mut packet = corrupted_bytes;
        packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
        for (index, value) in corruption_indices.iter().zip(corruption_values.iter()) {
            packet[*index] = *value;
        }
        let _ = DhcpPacket::decode(&packet);
    }

    #[test]
    fn decode_never_panics_on_random_option_lengths(
        option_code in 1u8..254,
        option_length in any::<u8>(),
        option_data in prop::collection::vec(any::<u8>(), 0..256)
    ) {
        let mut packet = valid_header();
        packet.push(option_code);
        packet.push(option_length);
        let actual_len = (option_length as usize).min(option_data.len());
        packet.extend_from_slice(&option_data[..actual_len]);
        packet.push(255);
        let _ = DhcpPacket::decode(&packet);
    }

    #[test]
    fn decode_never_panics_on_overloaded_fields(
        overload_flag in any::<u8>(),
        sname_data in prop::collection::vec(any::<u8>(), 64..=64),
        file_data in prop::collection::vec(any::<u8>(), 128..=128)
    ) {
        let mut packet = valid_header();
        packet[44..108].copy_from_slice(&sname_data);
        packet[108..236].copy_from_slice(&file_data);
        packet.push(52);
        packet.push(1);
        packet.push(overload_flag);
        packet.push(255);
        let _ = DhcpPacket::decode(&packet);
    }

    #[test]
    fn roundtrip_reproduces_every_field(
        packet in packet(),
        minimum_size in prop_oneof![Just(312usize), Just(576usize), Just(1500usize)],
    ) {
        let encoded = packet.encode(minimum_size);
        prop_assert!(encoded.len() >= minimum_size);

        let decoded = DhcpPacket::decode(&encoded).unwrap();
        prop_assert_eq!(decoded, packet);
    }

    #[test]
    fn encode_never_below_floor(
        packet in packet(),
        minimum_size in 0usize..312,
    ) {
        prop_assert!(packet.encode(minimum_size).len() >= 312);
    }

    #[test]
    fn overload_merges_sname_and_file_after_main_options(
        main in prop::collection::vec(option(), 0..3),
        in_sname in option(),
        in_file in option(),
    ) {
        let sname_bytes = in_sname.encode();
        let file_bytes = in_file.encode();
        prop_assume!(sname_bytes.len() < 64 && file_bytes.len() < 128);

        let mut packet = valid_header();
        packet[44..44 + sname_bytes.len()].copy_from_slice(&sname_bytes);
        packet[44 + sname_bytes.len()] = 255;
        packet[108..108 + file_bytes.len()].copy_from_slice(&file_bytes);
        packet[108 + file_bytes.len()] = 255;
        for option in &main {
            packet.extend_from_slice(&option.encode());
        }
        packet.extend_from_slice(&[52, 1, 3, 255]);

        let decoded = DhcpPacket::decode(&packet).unwrap();

        let mut expected = main.clone();
        expected.push(DhcpOption::OptionOverload(leasekeeper::options::OverloadFlag::Both));
        expected.push(in_sname);
        expected.push(in_file);
        prop_assert_eq!(decoded.options, expected);
        prop_assert!(decoded.sname.is_empty());
        prop_assert!(decoded.file.is_empty());
    }

    #[test]
    fn short_packets_always_rejected(
        data in prop::collection::vec(any::<u8>(), 0..240)
    ) {
        let result = DhcpPacket::decode(&data);
        prop_assert!(result.is_err());
    }

    #[test]
    fn bad_magic_cookie_always_rejected(
        cookie in any::<[u8; 4]>()
    ) {
        prop_assume!(cookie != DHCP_MAGIC_COOKIE);

        let mut packet = valid_header();
        packet[236..240].copy_from_slice(&cookie);
        packet.push(255);

        let result = DhcpPacket::decode(&packet);
        prop_assert!(result.is_err());
    }

    #[test]
    fn excessive_hops_always_rejected(
        hops in 17u8..=255
    ) {
        let mut packet = valid_header();
        packet[3] = hops;
        packet.push(255);

        let result = DhcpPacket::decode(&packet);
        prop_assert!(result.is_err());
    }
}
