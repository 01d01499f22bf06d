//! Common test utilities: hand-assembled target classes for driving the
//! rewriter without a JVM.

use classweave::classfile::code::{self, Insn};
use classweave::classfile::{
    AttributeInfo, ClassFile, ConstantPool, MemberInfo, Writer, ACC_PUBLIC, ACC_STATIC, ACC_SUPER,
};

pub struct ClassBuilder {
    pool: ConstantPool,
    this_class: u16,
    super_class: u16,
    fields: Vec<MemberInfo>,
    methods: Vec<MemberInfo>,
}

pub struct MethodSpec<'a> {
    pub name: &'a str,
    pub descriptor: &'a str,
    pub access: u16,
    pub max_stack: u16,
    pub max_locals: u16,
    pub insns: Vec<Insn>,
    /// StackMapTable payload, pre-encoded (None for branch-free methods).
    pub stack_map: Option<Vec<u8>>,
}

impl ClassBuilder {
    pub fn new(internal_name: &str) -> ClassBuilder {
        let mut pool = ConstantPool::new();
        let this_class = pool.ensure_class(internal_name);
        let super_class = pool.ensure_class("java/lang/Object");
        ClassBuilder {
            pool,
            this_class,
            super_class,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, descriptor: &str, access: u16) -> Self {
        let name_index = self.pool.ensure_utf8(name);
        let descriptor_index = self.pool.ensure_utf8(descriptor);
        self.fields.push(MemberInfo {
            access_flags: access,
            name_index,
            descriptor_index,
            attributes: Vec::new(),
        });
        self
    }

    pub fn method(mut self, spec: MethodSpec<'_>) -> Self {
        let (code_bytes, _) = code::encode(&spec.insns).expect("test code encodes");
        let mut code = Writer::new();
        code.u2(spec.max_stack);
        code.u2(spec.max_locals);
        code.u4(code_bytes.len() as u32);
        code.bytes(&code_bytes);
        code.u2(0); // exception table
        match &spec.stack_map {
            None => code.u2(0),
            Some(payload) => {
                code.u2(1);
                let name_index = self.pool.ensure_utf8("StackMapTable");
                code.u2(name_index);
                code.u4(payload.len() as u32);
                code.bytes(payload);
            }
        }
        let code_attr = AttributeInfo {
            name_index: self.pool.ensure_utf8("Code"),
            info: code.finish(),
        };
        let name_index = self.pool.ensure_utf8(spec.name);
        let descriptor_index = self.pool.ensure_utf8(spec.descriptor);
        self.methods.push(MemberInfo {
            access_flags: spec.access,
            name_index,
            descriptor_index,
            attributes: vec![code_attr],
        });
        self
    }

    pub fn build(self) -> Vec<u8> {
        let class = ClassFile {
            minor: 0,
            major: 55,
            pool: self.pool,
            access_flags: ACC_PUBLIC | ACC_SUPER,
            this_class: self.this_class,
            super_class: self.super_class,
            interfaces: Vec::new(),
            fields: self.fields,
            methods: self.methods,
            attributes: Vec::new(),
        };
        class.to_bytes()
    }
}

/// `public int work(int)`: returns 0 below a threshold, the argument
/// above it. Two return sites, one branch, one SAME frame.
pub fn demo_class() -> Vec<u8> {
    use classweave::classfile::code::op;
    // 0: iload_1
    // 1: iconst_2
    // 2: if_icmpge -> 5
    // 3: iconst_0
    // 4: ireturn
    // 5: iload_1      <- SAME frame here
    // 6: ireturn
    let insns = vec![
        Insn::plain(0x1b),
        Insn::plain(0x05),
        Insn::Branch {
            opcode: op::IF_ICMPGE,
            target: 5,
        },
        Insn::plain(0x03),
        Insn::plain(op::IRETURN),
        Insn::plain(0x1b),
        Insn::plain(op::IRETURN),
    ];
    // One same_frame entry at byte offset 7 (iload_1 after the two
    // returns): offsets are 0,1,2,5,6,7,8.
    let stack_map = vec![0x00, 0x01, 0x07];
    ClassBuilder::new("com/x/Demo")
        .field("count", "I", ACC_PUBLIC)
        .field("TOTAL", "J", ACC_PUBLIC | ACC_STATIC)
        .method(MethodSpec {
            name: "work",
            descriptor: "(I)I",
            access: ACC_PUBLIC,
            max_stack: 2,
            max_locals: 2,
            insns,
            stack_map: Some(stack_map),
        })
        .build()
}

pub const DEMO_PROBE: &str = r#"<agent>
  <events>
    <event id="demo.probe">
      <label>Demo Probe</label>
      <class>com.x.Demo</class>
      <method>
        <name>work</name>
        <descriptor>(I)I</descriptor>
        <parameters>
          <parameter index="0"><name>input</name></parameter>
        </parameters>
        <returnvalue><name>result</name></returnvalue>
      </method>
      <location>WRAP</location>
      <fields>
        <field><name>count</name><expression>this.count</expression></field>
      </fields>
    </event>
  </events>
</agent>"#;
